//! Background progress polling, one task per launched session.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::OrchestratorConfig;
use crate::resolver::ContentResolver;
use crate::session::SessionRegistry;

/// Poll timing.
#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Used after a failed or timed-out fetch.
    pub backoff: Duration,
    pub fetch_timeout: Duration,
}

impl PollerSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            interval: config.progress_poll_interval(),
            backoff: config.progress_backoff_interval(),
            fetch_timeout: config.progress_fetch_timeout(),
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Handle to a running poller. Dropping it cancels the task.
pub struct PollerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Cancel the poller and wait for the task to finish.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Copies content progress into one session record until cancelled.
pub struct ProgressPoller {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn ContentResolver>,
    session_id: String,
    generation: u64,
    locator: String,
    settings: PollerSettings,
}

impl ProgressPoller {
    /// Spawn a poller bound to one generation of session `session_id`.
    ///
    /// The task ends on cancellation or once the record is gone or replaced.
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn ContentResolver>,
        session_id: impl Into<String>,
        generation: u64,
        locator: impl Into<String>,
        settings: PollerSettings,
    ) -> PollerHandle {
        let token = CancellationToken::new();
        let poller = Self {
            registry,
            resolver,
            session_id: session_id.into(),
            generation,
            locator: locator.into(),
            settings,
        };
        let task = tokio::spawn(poller.run(token.clone()));
        PollerHandle {
            token,
            task: Some(task),
        }
    }

    async fn run(self, token: CancellationToken) {
        let session_id = self.session_id.as_str();
        debug!(session_id, "Progress poller started");

        loop {
            if self.registry.generation_of(session_id) != Some(self.generation) {
                debug!(session_id, "Session gone, progress poller exiting");
                break;
            }

            let fetch = tokio::time::timeout(
                self.settings.fetch_timeout,
                self.resolver.fetch_progress(&self.locator),
            );
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = fetch => result,
            };

            let delay = match result {
                Ok(Ok(snapshot)) => {
                    let generation = self.generation;
                    self.registry.update(session_id, |record| {
                        if record.generation == generation {
                            record.progress = snapshot;
                        }
                    });
                    self.settings.interval
                }
                Ok(Err(e)) => {
                    trace!(session_id, error = %e, "Progress fetch failed");
                    self.settings.backoff
                }
                Err(_) => {
                    trace!(session_id, "Progress fetch timed out");
                    self.settings.backoff
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(session_id, "Progress poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Result;
    use crate::resolver::{ContentFile, ProgressSnapshot};
    use crate::session::{ContentContext, SessionRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingResolver {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ContentResolver for CountingResolver {
        fn stream_url(&self, locator: &str, _index: u32, _start_byte: u64) -> Result<String> {
            Ok(locator.to_string())
        }

        async fn fetch_progress(&self, _locator: &str) -> Result<ProgressSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(crate::Error::Other("unavailable".to_string()));
            }
            Ok(ProgressSnapshot {
                info_hash: Some("abc".to_string()),
                bytes_completed: u64::from(n) * 1000,
                ..Default::default()
            })
        }

        async fn list_files(&self, _locator: &str) -> Result<Vec<ContentFile>> {
            Ok(Vec::new())
        }
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            interval: Duration::from_millis(10),
            backoff: Duration::from_millis(20),
            fetch_timeout: Duration::from_millis(100),
        }
    }

    fn registry_with(id: &str, generation: u64) -> Arc<SessionRegistry> {
        let registry = Arc::new(SessionRegistry::new());
        registry.upsert(
            id,
            || SessionRecord::admitted(id, ContentContext::new("magnet:?xt=1", 0, None), generation, Utc::now()),
            |_| (),
        );
        registry
    }

    #[tokio::test]
    async fn test_poller_copies_progress() {
        let registry = registry_with("s1", 1);
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let handle = ProgressPoller::spawn(registry.clone(), resolver.clone(), "s1", 1, "magnet:?xt=1", settings());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel().await;

        let progress = registry.get("s1").unwrap().progress;
        assert_eq!(progress.info_hash.as_deref(), Some("abc"));
        assert!(progress.bytes_completed >= 1000);

        let calls = resolver.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), calls);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_previous_snapshot() {
        let registry = registry_with("s1", 1);
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let handle = ProgressPoller::spawn(registry.clone(), resolver.clone(), "s1", 1, "magnet:?xt=1", settings());

        tokio::time::sleep(Duration::from_millis(70)).await;
        handle.cancel().await;

        assert!(resolver.calls.load(Ordering::SeqCst) >= 1);
        assert!(registry.get("s1").unwrap().progress.is_empty());
    }

    #[tokio::test]
    async fn test_poller_exits_when_session_is_replaced() {
        let registry = registry_with("s1", 1);
        let resolver = Arc::new(CountingResolver {
            calls: AtomicU32::new(0),
            fail: false,
        });
        registry.update("s1", |r| r.generation = 2);

        let handle = ProgressPoller::spawn(registry.clone(), resolver.clone(), "s1", 1, "magnet:?xt=1", settings());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_finished());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
    }
}
