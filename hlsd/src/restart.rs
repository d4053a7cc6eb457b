//! Resuming a session from its retained artifacts.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::artifacts::{ArtifactStore, ResumePoint};
use crate::events::SessionEvent;
use crate::launcher::PipelineLauncher;
use crate::session::{LifecyclePhase, SessionRegistry};
use crate::{Error, Result};

/// Replaces the pipeline of an existing session with one that continues the
/// stream where the previous one left off.
pub struct RestartController {
    registry: Arc<SessionRegistry>,
    launcher: Arc<PipelineLauncher>,
    artifacts: ArtifactStore,
    cap: usize,
}

impl RestartController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        launcher: Arc<PipelineLauncher>,
        artifacts: ArtifactStore,
        cap: usize,
    ) -> Self {
        Self {
            registry,
            launcher,
            artifacts,
            cap,
        }
    }

    /// Restart session `id`.
    ///
    /// The slot is claimed and the old handles are detached in one critical
    /// section. A session that still held its slot keeps it; one that had lost
    /// it competes for a slot like a new admission. The resume point is
    /// computed only after the old process is gone, so its last chunk is final.
    pub async fn restart(&self, id: &str) -> Result<ResumePoint> {
        let generation = self.registry.next_generation();
        let cap = self.cap;
        let claimed = self.registry.with_sessions(|sessions| {
            let others = sessions.values().filter(|r| r.running && r.id != id).count();
            let Some(record) = sessions.get_mut(id) else {
                return Err(Error::not_restartable(id));
            };
            if !record.running && others >= cap {
                return Err(Error::CapacityExceeded { running: others, cap });
            }

            let now = Utc::now();
            record.generation = generation;
            record.set_running(true, now);
            record.set_phase(LifecyclePhase::Restarting, now);
            record.last_client_seen = now;
            record.status_message = "Restarting...".to_string();
            Ok((record.context.clone(), record.progress.bytes_completed, record.take_handles()))
        });
        let (context, byte_offset, handles) = claimed?;

        if let Some(outcome) = self.launcher.release(handles).await {
            info!(session_id = %id, ?outcome, "Stopped pipeline for restart");
        }

        let resume = match self.prepare_artifacts(id, byte_offset).await {
            Ok(resume) => resume,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to prepare artifacts for restart");
                self.registry.update(id, |record| {
                    if record.generation == generation {
                        let now = Utc::now();
                        record.set_running(false, now);
                        record.set_phase(LifecyclePhase::Terminated, now);
                        record.status_message = format!("Error: {e}");
                    }
                });
                return Err(e);
            }
        };

        info!(
            session_id = %id,
            byte_offset = resume.byte_offset,
            chunk_index = resume.chunk_index,
            "Resuming session"
        );
        self.launcher.emit(SessionEvent::Restarting {
            session_id: id.to_string(),
            resume,
        });

        self.launcher.start(id, &context, Some(resume)).await?;
        Ok(resume)
    }

    async fn prepare_artifacts(&self, id: &str, byte_offset: u64) -> Result<ResumePoint> {
        let resume = self.artifacts.resume_point(id, byte_offset).await?;
        self.artifacts.splice_end_marker(id).await?;
        Ok(resume)
    }
}
