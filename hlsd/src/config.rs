//! Orchestrator configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Configuration for the session orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root directory holding one artifact directory per session.
    pub streams_base_dir: PathBuf,
    /// Maximum number of pipelines running at once.
    pub max_concurrent_sessions: usize,
    /// A session whose client has not been seen for this long is hard-stopped.
    pub stall_timeout_secs: u64,
    /// Period of the reaper sweep.
    pub reaper_interval_secs: u64,
    /// Retention of soft-stopped sessions before their artifacts are removed.
    pub idle_cleanup_secs: u64,
    /// Progress poll interval.
    pub progress_poll_interval_ms: u64,
    /// Poll interval after a failed progress fetch.
    pub progress_backoff_interval_ms: u64,
    /// Upper bound for a single progress round trip.
    pub progress_fetch_timeout_ms: u64,
    /// Time a pipeline gets to exit after SIGTERM before it is killed.
    pub stop_grace_period_ms: u64,
    /// Upper bound for media analysis before launch.
    pub probe_timeout_secs: u64,
    /// Base URL of the content resolution API.
    pub content_api_base_url: String,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub mpv_path: String,
    /// Target duration of one HLS chunk.
    pub hls_segment_secs: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            streams_base_dir: PathBuf::from("streams"),
            max_concurrent_sessions: 4,
            stall_timeout_secs: 45,
            reaper_interval_secs: 30,
            idle_cleanup_secs: 3600,
            progress_poll_interval_ms: 2000,
            progress_backoff_interval_ms: 4000,
            progress_fetch_timeout_ms: 10_000,
            stop_grace_period_ms: 5000,
            probe_timeout_secs: 30,
            content_api_base_url: "http://localhost:3000".to_string(),
            log_dir: None,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            mpv_path: "mpv".to_string(),
            hls_segment_secs: 4,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `HLSD_STREAMS_DIR`, `HLSD_MAX_CONCURRENT`, `HLSD_STALL_TIMEOUT_SECS`,
    ///   `HLSD_REAPER_INTERVAL_SECS`, `HLSD_IDLE_CLEANUP_SECS`, `HLSD_PROGRESS_POLL_MS`,
    ///   `HLSD_STOP_GRACE_MS`, `HLSD_CONTENT_API_URL`, `HLSD_LOG_DIR`
    /// - `FFMPEG_PATH`, `FFPROBE_PATH`, `MPV_PATH`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = text("HLSD_STREAMS_DIR") {
            config.streams_base_dir = PathBuf::from(dir);
        }
        if let Some(url) = text("HLSD_CONTENT_API_URL") {
            config.content_api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(dir) = text("HLSD_LOG_DIR") {
            config.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = text("FFMPEG_PATH") {
            config.ffmpeg_path = path;
        }
        if let Some(path) = text("FFPROBE_PATH") {
            config.ffprobe_path = path;
        }
        if let Some(path) = text("MPV_PATH") {
            config.mpv_path = path;
        }

        parse_into(&lookup, "HLSD_MAX_CONCURRENT", &mut config.max_concurrent_sessions);
        parse_into(&lookup, "HLSD_STALL_TIMEOUT_SECS", &mut config.stall_timeout_secs);
        parse_into(&lookup, "HLSD_REAPER_INTERVAL_SECS", &mut config.reaper_interval_secs);
        parse_into(&lookup, "HLSD_IDLE_CLEANUP_SECS", &mut config.idle_cleanup_secs);
        parse_into(&lookup, "HLSD_STOP_GRACE_MS", &mut config.stop_grace_period_ms);
        if parse_into(&lookup, "HLSD_PROGRESS_POLL_MS", &mut config.progress_poll_interval_ms) {
            config.progress_backoff_interval_ms = config.progress_poll_interval_ms.saturating_mul(2);
        }

        config
    }

    /// Reject settings the orchestrator cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(Error::config("max_concurrent_sessions must be at least 1"));
        }
        if self.reaper_interval_secs == 0 {
            return Err(Error::config("reaper_interval_secs must be at least 1"));
        }
        if self.progress_poll_interval_ms == 0 {
            return Err(Error::config("progress_poll_interval_ms must be at least 1"));
        }
        if self.idle_cleanup_secs <= self.stall_timeout_secs {
            return Err(Error::config(format!(
                "idle_cleanup_secs ({}) must be longer than stall_timeout_secs ({})",
                self.idle_cleanup_secs, self.stall_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn stall_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_timeout_secs as i64)
    }

    pub fn idle_cleanup(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_cleanup_secs as i64)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn progress_poll_interval(&self) -> Duration {
        Duration::from_millis(self.progress_poll_interval_ms)
    }

    pub fn progress_backoff_interval(&self) -> Duration {
        Duration::from_millis(self.progress_backoff_interval_ms)
    }

    pub fn progress_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.progress_fetch_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Parse `key` into `slot`, keeping the current value on absent or invalid input.
fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            false
        }
    }
}
