//! The public face of the crate: every session operation a request layer needs.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::admission::{Admission, AdmissionController, RejectReason};
use crate::artifacts::{ArtifactStore, ResumePoint};
use crate::config::OrchestratorConfig;
use crate::events::{SessionEvent, StopReason};
use crate::launcher::{CodecProbePolicy, DependencyStatus, HlsPipelineTool, PipelineLauncher, PipelineTool, StrategyPolicy};
use crate::progress::PollerSettings;
use crate::reaper::{Reaper, ReaperSettings, SweepReport};
use crate::resolver::{ContentFile, ContentResolver, HttpContentResolver, ProgressSnapshot};
use crate::restart::RestartController;
use crate::session::{ContentContext, ProcessState, SessionLocks, SessionRegistry, SessionSnapshot};
use crate::{Error, Result};

/// Capacity of the session event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Answer to [`SessionOrchestrator::is_active`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityReport {
    /// A pipeline holds a slot and has not exited.
    pub active: bool,
    /// A record exists, so the content can be restarted.
    pub has_context: bool,
    pub is_remote_content: bool,
    pub context: Option<ContentContext>,
}

/// Reject ids that cannot safely name a directory under the streams base.
pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && !id.contains("..")
        && !id.contains(['/', '\\', '\0'])
        && id.len() <= 128;
    if valid {
        Ok(())
    } else {
        Err(Error::invalid_session(id))
    }
}

/// Owns the registry and every component acting on it.
pub struct SessionOrchestrator {
    config: OrchestratorConfig,
    registry: Arc<SessionRegistry>,
    locks: Arc<SessionLocks>,
    launcher: Arc<PipelineLauncher>,
    admission: AdmissionController,
    restarts: RestartController,
    reaper: Arc<Reaper>,
    resolver: Arc<dyn ContentResolver>,
    events: broadcast::Sender<SessionEvent>,
    reaper_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        resolver: Arc<dyn ContentResolver>,
        tool: Arc<dyn PipelineTool>,
        policy: Arc<dyn StrategyPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new());
        let locks = Arc::new(SessionLocks::new());
        let artifacts = ArtifactStore::new(&config.streams_base_dir);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let launcher = Arc::new(PipelineLauncher::new(
            registry.clone(),
            resolver.clone(),
            tool,
            policy,
            artifacts.clone(),
            events.clone(),
            PollerSettings::from_config(&config),
            config.stop_grace_period(),
        ));
        let admission = AdmissionController::new(registry.clone(), launcher.clone(), config.max_concurrent_sessions);
        let restarts = RestartController::new(
            registry.clone(),
            launcher.clone(),
            artifacts,
            config.max_concurrent_sessions,
        );
        let reaper = Arc::new(Reaper::new(
            registry.clone(),
            launcher.clone(),
            locks.clone(),
            ReaperSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            registry,
            locks,
            launcher,
            admission,
            restarts,
            reaper,
            resolver,
            events,
            reaper_task: Mutex::new(None),
        })
    }

    /// Production wiring: HTTP content API, ffprobe codec check, ffmpeg/mpv pipeline.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let resolver = Arc::new(HttpContentResolver::new(
            config.content_api_base_url.clone(),
            config.progress_fetch_timeout(),
        )?);
        let tool = Arc::new(HlsPipelineTool::from_config(&config));
        let policy = Arc::new(CodecProbePolicy::new(config.ffprobe_path.clone(), config.probe_timeout()));
        Self::new(config, resolver, tool, policy)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn locks(&self) -> &Arc<SessionLocks> {
        &self.locks
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        self.launcher.artifacts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// A copy of one session, if it exists.
    pub fn session(&self, id: &str) -> Option<SessionSnapshot> {
        self.registry.get(id)
    }

    /// Admit and launch a session.
    ///
    /// A previous record with the same id is hard-stopped first. When the cap
    /// is reached the call fails with [`Error::CapacityExceeded`].
    pub async fn start_session(
        &self,
        id: &str,
        locator: &str,
        index: u32,
        subtitle_index: Option<u32>,
    ) -> Result<Admission> {
        validate_session_id(id)?;
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(Error::validation("content locator must not be empty"));
        }

        let guard = self.locks.acquire(id).await;
        let result = self.start_locked(id, ContentContext::new(locator, index, subtitle_index)).await;
        drop(guard);
        self.locks.prune(id);
        result
    }

    async fn start_locked(&self, id: &str, context: ContentContext) -> Result<Admission> {
        if self.registry.contains(id) {
            self.launcher.stop(id, StopReason::Replaced, true).await;
        }

        let admission = self.admission.try_admit(id, &context).await;
        if let Admission::Preempted { evicted } = &admission {
            for orphan in evicted {
                self.locks.prune(orphan);
            }
        }
        if let Admission::Rejected(RejectReason::Busy { running, cap }) = admission {
            return Err(Error::CapacityExceeded { running, cap });
        }

        self.launcher.start(id, &context, None).await?;
        Ok(admission)
    }

    /// Stop a session. `hard` also removes its record and artifacts.
    ///
    /// Unknown ids are a no-op.
    pub async fn stop_session(&self, id: &str, hard: bool) {
        let guard = self.locks.acquire(id).await;
        self.launcher.stop(id, StopReason::ClientRequest, hard).await;
        drop(guard);
        self.locks.prune(id);
    }

    /// Resume a session from its artifacts.
    pub async fn restart_session(&self, id: &str) -> Result<ResumePoint> {
        validate_session_id(id).map_err(|_| Error::not_restartable(id))?;
        let guard = self.locks.acquire(id).await;
        let result = self.restarts.restart(id).await;
        drop(guard);
        self.locks.prune(id);
        result
    }

    /// Record that the client of `id` is still watching.
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        self.registry
            .update(id, |record| record.last_client_seen = Utc::now())
            .ok_or_else(|| Error::invalid_session(id))
    }

    /// Latest progress of `id`; empty for unknown ids.
    pub fn progress(&self, id: &str) -> ProgressSnapshot {
        self.registry.get(id).map(|s| s.progress).unwrap_or_default()
    }

    pub fn is_active(&self, id: &str) -> ActivityReport {
        match self.registry.get(id) {
            Some(snapshot) => ActivityReport {
                active: snapshot.running && !matches!(snapshot.process, ProcessState::Exited { .. }),
                has_context: true,
                is_remote_content: snapshot.context.is_remote_content(),
                context: Some(snapshot.context),
            },
            None => ActivityReport {
                active: false,
                has_context: false,
                is_remote_content: false,
                context: None,
            },
        }
    }

    pub fn status_message(&self, id: &str) -> Option<String> {
        self.registry.get(id).map(|s| s.status_message)
    }

    /// Files inside the content behind `locator`.
    pub async fn list_files(&self, locator: &str) -> Result<Vec<ContentFile>> {
        let locator = locator.trim();
        if locator.is_empty() {
            return Err(Error::validation("content locator must not be empty"));
        }
        self.resolver.list_files(locator).await
    }

    /// Probe the configured external binaries. Blocks briefly on each.
    pub fn dependency_status(&self) -> DependencyStatus {
        DependencyStatus::detect(&self.config)
    }

    /// Run one reaper sweep now.
    pub async fn sweep(&self) -> SweepReport {
        self.reaper.sweep(Utc::now()).await
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Start the periodic reaper. A second call is a no-op.
    pub fn spawn_reaper(&self) {
        let mut task = self.reaper_task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = self.reaper.clone().spawn(token.clone());
        *task = Some((token, handle));
        info!(interval = ?self.reaper.settings().interval, "Reaper started");
    }

    /// Stop the reaper, then hard-stop every session concurrently.
    pub async fn shutdown(&self) {
        let task = self.reaper_task.lock().take();
        if let Some((token, handle)) = task {
            token.cancel();
            let _ = handle.await;
        }

        let ids = self.registry.ids();
        info!(sessions = ids.len(), "Stopping all sessions");
        join_all(ids.iter().map(|id| async move {
            let guard = self.locks.acquire(id).await;
            self.launcher.stop(id, StopReason::Shutdown, true).await;
            drop(guard);
            self.locks.prune(id);
        }))
        .await;
        debug!("Orchestrator shut down");
    }
}
