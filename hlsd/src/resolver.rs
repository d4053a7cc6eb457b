//! Content resolution: turning a locator into a stream URL and reading its progress.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Download progress of a piece of content as reported by the content API.
///
/// Unknown fields are ignored and missing ones default, so partial payloads
/// still update what they carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressSnapshot {
    pub info_hash: Option<String>,
    pub name: Option<String>,
    pub percentage_completed: f64,
    /// Bytes per second.
    pub download_speed: f64,
    pub download_speed_human: Option<String>,
    pub connected_peers: u32,
    pub bytes_completed: u64,
    pub total_bytes: u64,
}

impl ProgressSnapshot {
    /// No progress has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.info_hash.is_none()
    }
}

/// A file inside a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFile {
    pub path: String,
    #[serde(default)]
    pub size: u64,
}

/// Resolves locators through an external content service.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    /// Direct URL the pipeline reads `index` of `locator` from, starting at `start_byte`.
    fn stream_url(&self, locator: &str, index: u32, start_byte: u64) -> Result<String>;

    async fn fetch_progress(&self, locator: &str) -> Result<ProgressSnapshot>;

    async fn list_files(&self, locator: &str) -> Result<Vec<ContentFile>>;
}

/// [`ContentResolver`] backed by the content HTTP API.
///
/// Endpoints, all relative to the base URL:
/// - `GET /stream?url=<locator>&index=<n>[&start_byte=<b>]`
/// - `GET /status?url=<locator>` returning a [`ProgressSnapshot`]
/// - `GET /files?url=<locator>` returning `{"Files": [{"path", "size"}]}`
pub struct HttpContentResolver {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpContentResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        install_rustls_provider();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        let raw = format!("{}/{}", self.base_url, path);
        Url::parse_with_params(&raw, params)
            .map_err(|e| Error::config(format!("invalid content API URL {raw}: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.client.get(url.clone()).timeout(self.timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(format!(
                "content API returned {status} for {}",
                url.path()
            )));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl ContentResolver for HttpContentResolver {
    fn stream_url(&self, locator: &str, index: u32, start_byte: u64) -> Result<String> {
        let mut params = vec![("url", locator.to_string()), ("index", index.to_string())];
        if start_byte > 0 {
            params.push(("start_byte", start_byte.to_string()));
        }
        Ok(self.endpoint("stream", &params)?.to_string())
    }

    async fn fetch_progress(&self, locator: &str) -> Result<ProgressSnapshot> {
        let url = self.endpoint("status", &[("url", locator.to_string())])?;
        self.get_json(url).await
    }

    async fn list_files(&self, locator: &str) -> Result<Vec<ContentFile>> {
        #[derive(Deserialize)]
        struct FilesResponse {
            #[serde(rename = "Files", default)]
            files: Vec<ContentFile>,
        }

        let url = self.endpoint("files", &[("url", locator.to_string())])?;
        let response: FilesResponse = self.get_json(url).await?;
        Ok(response.files)
    }
}
