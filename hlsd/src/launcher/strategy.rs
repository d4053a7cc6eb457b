//! Choosing between remuxing and transcoding.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Result;
use crate::artifacts::ResumePoint;

/// How the segmenter gets its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStrategy {
    /// The source codecs are playable as-is; the segmenter copies streams.
    Remux,
    /// A decoder re-encodes the source into a playable transport stream first.
    Transcode,
}

impl PipelineStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remux => "remux",
            Self::Transcode => "transcode",
        }
    }

    pub fn status_message(&self) -> &'static str {
        match self {
            Self::Remux => "Compatible codecs found, remuxing...",
            Self::Transcode => "Transcoding required...",
        }
    }
}

impl std::fmt::Display for PipelineStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decides the [`PipelineStrategy`] for a launch.
#[async_trait]
pub trait StrategyPolicy: Send + Sync {
    /// `resume` is set when the launch continues an earlier pipeline.
    async fn select(&self, source_url: &str, resume: Option<&ResumePoint>) -> Result<PipelineStrategy>;
}

/// Always the same strategy.
#[derive(Debug, Clone, Copy)]
pub struct FixedStrategy(pub PipelineStrategy);

#[async_trait]
impl StrategyPolicy for FixedStrategy {
    async fn select(&self, _source_url: &str, _resume: Option<&ResumePoint>) -> Result<PipelineStrategy> {
        Ok(self.0)
    }
}

/// Codecs reported by a probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbedCodecs {
    pub video: Option<String>,
    pub audio: Option<String>,
}

impl ProbedCodecs {
    /// Parse `ffprobe -print_format json -show_streams` output.
    pub fn from_probe_json(stdout: &[u8]) -> Option<Self> {
        #[derive(Deserialize)]
        struct ProbeOutput {
            #[serde(default)]
            streams: Vec<ProbeStream>,
        }

        #[derive(Deserialize)]
        struct ProbeStream {
            codec_type: Option<String>,
            codec_name: Option<String>,
        }

        let output: ProbeOutput = serde_json::from_slice(stdout).ok()?;
        let first_of = |kind: &str| {
            output
                .streams
                .iter()
                .find(|s| s.codec_type.as_deref() == Some(kind))
                .and_then(|s| s.codec_name.clone())
        };
        Some(Self {
            video: first_of("video"),
            audio: first_of("audio"),
        })
    }

    /// Whether every stream can be copied into an HLS transport stream.
    pub fn is_remuxable(&self) -> bool {
        const VIDEO: &[&str] = &["h264"];
        const AUDIO: &[&str] = &["aac", "ac3", "mp3"];

        let video_ok = self.video.as_deref().is_some_and(|c| VIDEO.contains(&c));
        let audio_ok = self.audio.as_deref().is_none_or(|c| AUDIO.contains(&c));
        video_ok && audio_ok
    }
}

/// Probes the source with ffprobe and remuxes when the codecs allow it.
///
/// Any probe failure falls back to transcoding. Resumed launches skip the probe
/// and transcode.
#[derive(Debug, Clone)]
pub struct CodecProbePolicy {
    ffprobe_path: String,
    timeout: Duration,
}

impl CodecProbePolicy {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }

    async fn probe(&self, source_url: &str) -> Option<ProbedCodecs> {
        let mut command = process_utils::tokio_command(&self.ffprobe_path);
        command
            .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(source_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        // The child is killed when the timed-out future is dropped.
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) if output.status.success() => ProbedCodecs::from_probe_json(&output.stdout),
            Ok(Ok(output)) => {
                debug!(status = %output.status, "ffprobe failed");
                None
            }
            Ok(Err(e)) => {
                warn!(error = %e, path = %self.ffprobe_path, "Failed to run ffprobe");
                None
            }
            Err(_) => {
                warn!(timeout = ?self.timeout, "ffprobe timed out");
                None
            }
        }
    }
}

#[async_trait]
impl StrategyPolicy for CodecProbePolicy {
    async fn select(&self, source_url: &str, resume: Option<&ResumePoint>) -> Result<PipelineStrategy> {
        if resume.is_some() {
            return Ok(PipelineStrategy::Transcode);
        }

        let strategy = match self.probe(source_url).await {
            Some(codecs) if codecs.is_remuxable() => PipelineStrategy::Remux,
            Some(codecs) => {
                info!(video = ?codecs.video, audio = ?codecs.audio, "Source needs transcoding");
                PipelineStrategy::Transcode
            }
            None => PipelineStrategy::Transcode,
        };
        Ok(strategy)
    }
}
