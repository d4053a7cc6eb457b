//! Admission control: one session per content, a cap on running pipelines.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::events::{SessionEvent, StopReason};
use crate::launcher::PipelineLauncher;
use crate::session::{ContentContext, SessionHandles, SessionRecord, SessionRegistry};

/// Result of [`AdmissionController::try_admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted after hard-stopping the sessions that held the same content.
    Preempted { evicted: Vec<String> },
    Rejected(RejectReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The cap was reached.
    Busy { running: usize, cap: usize },
}

/// Decides whether a new session may claim a slot.
pub struct AdmissionController {
    registry: Arc<SessionRegistry>,
    launcher: Arc<PipelineLauncher>,
    cap: usize,
}

impl AdmissionController {
    pub fn new(registry: Arc<SessionRegistry>, launcher: Arc<PipelineLauncher>, cap: usize) -> Self {
        Self {
            registry,
            launcher,
            cap,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Admit session `id` for `context`.
    ///
    /// Any other session on the same locator is hard-stopped first, and that
    /// stop completes before the cap is checked. The cap check and the
    /// insertion of the new record happen in one critical section, so
    /// concurrent admissions never exceed the cap. Sessions admitted for the
    /// same locator while the first stops were running are evicted in that
    /// same critical section, so at most one record holds a locator.
    pub async fn try_admit(&self, id: &str, context: &ContentContext) -> Admission {
        let mut evicted: Vec<String> = self.registry.with_sessions(|sessions| {
            sessions
                .values()
                .filter(|r| r.id != id && r.context.locator == context.locator)
                .map(|r| r.id.clone())
                .collect()
        });

        for orphan in &evicted {
            warn!(session_id = %id, evicted = %orphan, "Content already streaming, preempting");
            self.launcher.stop(orphan, StopReason::Preempted, true).await;
            self.launcher.emit(SessionEvent::Preempted {
                session_id: id.to_string(),
                evicted: orphan.clone(),
            });
        }

        let generation = self.registry.next_generation();
        let cap = self.cap;
        let admitted = self.registry.with_sessions(|sessions| {
            let late: Vec<String> = sessions
                .values()
                .filter(|r| r.id != id && r.context.locator == context.locator)
                .map(|r| r.id.clone())
                .collect();
            let running = sessions
                .values()
                .filter(|r| r.running && r.id != id && !late.contains(&r.id))
                .count();
            if running >= cap {
                return Err(running);
            }

            let late: Vec<(String, SessionHandles)> = late
                .into_iter()
                .filter_map(|orphan| {
                    let handles = sessions.remove(&orphan)?.take_handles();
                    Some((orphan, handles))
                })
                .collect();
            let record = SessionRecord::admitted(id, context.clone(), generation, Utc::now());
            Ok((sessions.insert(id.to_string(), record), late))
        });

        let (displaced, late) = match admitted {
            Ok(admitted) => admitted,
            Err(running) => {
                warn!(session_id = %id, running, cap, "Rejecting session, at capacity");
                self.launcher.emit(SessionEvent::Rejected {
                    session_id: id.to_string(),
                    running,
                    cap,
                });
                return Admission::Rejected(RejectReason::Busy { running, cap });
            }
        };

        if let Some(mut previous) = displaced {
            let handles = previous.take_handles();
            if !handles.is_empty() {
                warn!(session_id = %id, "Replacing live record with the same id");
                self.launcher.release(handles).await;
            }
        }

        for (orphan, handles) in late {
            warn!(session_id = %id, evicted = %orphan, "Content claimed concurrently, preempting");
            self.launcher
                .finish_stop(&orphan, StopReason::Preempted, true, Some(handles))
                .await;
            self.launcher.emit(SessionEvent::Preempted {
                session_id: id.to_string(),
                evicted: orphan.clone(),
            });
            evicted.push(orphan);
        }

        info!(session_id = %id, locator = %context.locator, "Session admitted");
        self.launcher.emit(SessionEvent::Admitted {
            session_id: id.to_string(),
            locator: context.locator.clone(),
        });
        if evicted.is_empty() {
            Admission::Admitted
        } else {
            Admission::Preempted { evicted }
        }
    }
}
