//! Pipeline launch and stop.
//!
//! [`PipelineLauncher`] is the only place that attaches a process to a session
//! record or detaches one from it. Nothing here blocks inside the registry lock:
//! handles are moved out under the lock and released after it is dropped.

mod process;
mod strategy;
mod tool;

pub use process::{ExitState, PipelineProcess, PipelineStage, TerminateOutcome};
pub use strategy::{CodecProbePolicy, FixedStrategy, PipelineStrategy, ProbedCodecs, StrategyPolicy};
pub use tool::{DependencyStatus, HlsPipelineTool, PipelineRequest, PipelineTool, detect_version};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, ResumePoint};
use crate::events::{SessionEvent, StopReason};
use crate::progress::{PollerSettings, ProgressPoller};
use crate::resolver::ContentResolver;
use crate::session::{ContentContext, LifecyclePhase, SessionHandles, SessionRegistry};
use crate::{Error, Result};

/// Outcome of [`PipelineLauncher::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReport {
    /// Whether a record existed for the id.
    pub found: bool,
    /// `None` when no process was attached.
    pub terminated: Option<TerminateOutcome>,
}

/// Starts and stops the pipeline of a session.
pub struct PipelineLauncher {
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn ContentResolver>,
    tool: Arc<dyn PipelineTool>,
    policy: Arc<dyn StrategyPolicy>,
    artifacts: ArtifactStore,
    events: broadcast::Sender<SessionEvent>,
    poller_settings: PollerSettings,
    grace: Duration,
}

impl PipelineLauncher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn ContentResolver>,
        tool: Arc<dyn PipelineTool>,
        policy: Arc<dyn StrategyPolicy>,
        artifacts: ArtifactStore,
        events: broadcast::Sender<SessionEvent>,
        poller_settings: PollerSettings,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            resolver,
            tool,
            policy,
            artifacts,
            events,
            poller_settings,
            grace,
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Launch the pipeline for an admitted (or restarting) session.
    ///
    /// Returns the pid of the pipeline. On failure the record is left
    /// `Terminated` without a slot and its artifacts are removed.
    pub async fn start(&self, id: &str, context: &ContentContext, resume: Option<ResumePoint>) -> Result<u32> {
        let claimed = self.registry.update(id, |record| {
            record.set_phase(LifecyclePhase::Launching, Utc::now());
            record.status_message = "Analyzing media...".to_string();
            (record.generation, record.strategy)
        });
        let Some((generation, recorded)) = claimed else {
            return Err(Error::invalid_session(id));
        };

        match self.launch(id, context, resume, generation, recorded).await {
            Ok(pid) => Ok(pid),
            Err(err) => {
                let err = match err {
                    Error::InvalidSession { .. } | Error::LaunchFailure { .. } => err,
                    other => Error::launch_failure(id, other),
                };
                self.fail_launch(id, generation, &err).await;
                Err(err)
            }
        }
    }

    async fn launch(
        &self,
        id: &str,
        context: &ContentContext,
        resume: Option<ResumePoint>,
        generation: u64,
        recorded: Option<PipelineStrategy>,
    ) -> Result<u32> {
        let start_byte = resume.map_or(0, |r| r.byte_offset);
        let source_url = self.resolver.stream_url(&context.locator, context.index, start_byte)?;

        let strategy = match (resume, recorded) {
            (Some(_), Some(strategy)) => strategy,
            _ => self.policy.select(&source_url, resume.as_ref()).await?,
        };
        info!(session_id = %id, %strategy, resumed = resume.is_some(), "Launching pipeline");
        let message = match resume {
            Some(_) => "Resuming stream...",
            None => strategy.status_message(),
        };
        self.registry.update(id, |record| {
            if record.generation == generation {
                record.status_message = message.to_string();
            }
        });

        let working_dir = self.artifacts.ensure_session_dir(id).await?;
        let request = PipelineRequest {
            session_id: id.to_string(),
            working_dir,
            source_url,
            strategy,
            resume,
        };
        let process = self.tool.spawn(&request)?;
        let pid = process.pid();

        let poller = ProgressPoller::spawn(
            self.registry.clone(),
            self.resolver.clone(),
            id,
            generation,
            context.locator.clone(),
            self.poller_settings,
        );

        // Attach only if the record still belongs to this launch.
        let rejected = self.registry.with_sessions(|sessions| match sessions.get_mut(id) {
            Some(record) if record.generation == generation => {
                let now = Utc::now();
                record.process = Some(process);
                record.poller = Some(poller);
                record.strategy = Some(strategy);
                record.set_running(true, now);
                record.set_phase(LifecyclePhase::Running, now);
                record.status_message = "Streaming".to_string();
                None
            }
            _ => Some(SessionHandles {
                process: Some(process),
                poller: Some(poller),
            }),
        });

        if let Some(orphan) = rejected {
            warn!(session_id = %id, pid, "Session changed during launch, discarding pipeline");
            self.release(orphan).await;
            return Err(Error::invalid_session(id));
        }

        info!(session_id = %id, pid, "Pipeline running");
        self.emit(SessionEvent::Running {
            session_id: id.to_string(),
            pid,
        });
        Ok(pid)
    }

    async fn fail_launch(&self, id: &str, generation: u64, err: &Error) {
        warn!(session_id = %id, error = %err, "Pipeline launch failed");

        // Artifacts belong to a newer generation if the record was replaced.
        let owns_artifacts = self.registry.with_sessions(|sessions| match sessions.get_mut(id) {
            Some(record) if record.generation == generation => {
                let now = Utc::now();
                record.set_running(false, now);
                record.set_phase(LifecyclePhase::Terminated, now);
                record.status_message = format!("Error: {err}");
                true
            }
            Some(_) => false,
            None => true,
        });

        if owns_artifacts && let Err(e) = self.artifacts.remove_session_dir(id).await {
            warn!(session_id = %id, error = %e, "Failed to remove artifacts after launch failure");
        }
        self.emit(SessionEvent::LaunchFailed {
            session_id: id.to_string(),
            reason: err.to_string(),
        });
    }

    /// Stop the pipeline of `id`. Idempotent; unknown ids are a no-op.
    ///
    /// With `with_cleanup` the record and the artifact directory are removed,
    /// otherwise the record is kept `Terminated` without a slot so the session
    /// can be restarted from its artifacts.
    pub async fn stop(&self, id: &str, reason: StopReason, with_cleanup: bool) -> StopReport {
        let detached = self.registry.with_sessions(|sessions| {
            if with_cleanup {
                sessions.remove(id).map(|mut record| record.take_handles())
            } else {
                sessions.get_mut(id).map(|record| {
                    let now = Utc::now();
                    record.set_running(false, now);
                    record.set_phase(LifecyclePhase::Terminated, now);
                    record.status_message = "Stopped".to_string();
                    record.take_handles()
                })
            }
        });

        self.finish_stop(id, reason, with_cleanup, detached).await
    }

    /// Second half of [`stop`](Self::stop), for handles already detached from
    /// the registry. `None` means there was no record.
    pub(crate) async fn finish_stop(
        &self,
        id: &str,
        reason: StopReason,
        with_cleanup: bool,
        detached: Option<SessionHandles>,
    ) -> StopReport {
        let found = detached.is_some();
        let terminated = match detached {
            Some(handles) => self.release(handles).await,
            None => None,
        };

        if with_cleanup && let Err(e) = self.artifacts.remove_session_dir(id).await {
            warn!(session_id = %id, error = %e, "Failed to remove session artifacts");
        }

        if found {
            info!(session_id = %id, %reason, cleanup = with_cleanup, outcome = ?terminated, "Session stopped");
            self.emit(SessionEvent::Stopped {
                session_id: id.to_string(),
                reason,
                cleanup: with_cleanup,
            });
        } else {
            debug!(session_id = %id, %reason, "Stop for unknown session");
        }

        StopReport { found, terminated }
    }

    /// Cancel the poller and terminate the process of detached handles.
    pub(crate) async fn release(&self, handles: SessionHandles) -> Option<TerminateOutcome> {
        if let Some(poller) = handles.poller {
            poller.cancel().await;
        }
        match handles.process {
            Some(process) => Some(process.terminate(self.grace).await),
            None => None,
        }
    }
}
