//! Periodic reconciliation of session state with process and client liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::events::{SessionEvent, StopReason};
use crate::launcher::PipelineLauncher;
use crate::session::{LifecyclePhase, SessionLocks, SessionRegistry};

/// Timing rules applied on every sweep.
#[derive(Debug, Clone, Copy)]
pub struct ReaperSettings {
    /// Sessions whose client is silent for longer are hard-stopped.
    pub stall_timeout: chrono::Duration,
    /// Terminated sessions older than this (since their last transition) are removed.
    pub idle_cleanup: chrono::Duration,
    pub interval: Duration,
}

impl ReaperSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            stall_timeout: config.stall_timeout(),
            idle_cleanup: config.idle_cleanup(),
            interval: config.reaper_interval(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose process had exited; now `Stalled` without a slot.
    pub exited: Vec<String>,
    /// Hard-stopped because the client went silent.
    pub stalled: Vec<String>,
    /// Terminated sessions removed after their retention horizon.
    pub expired: Vec<String>,
    /// Due for a stop but busy with another operation; retried next sweep.
    pub skipped: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.exited.is_empty() && self.stalled.is_empty() && self.expired.is_empty() && self.skipped.is_empty()
    }
}

/// Sweeps the registry on a fixed interval.
pub struct Reaper {
    registry: Arc<SessionRegistry>,
    launcher: Arc<PipelineLauncher>,
    locks: Arc<SessionLocks>,
    settings: ReaperSettings,
}

impl Reaper {
    pub fn new(
        registry: Arc<SessionRegistry>,
        launcher: Arc<PipelineLauncher>,
        locks: Arc<SessionLocks>,
        settings: ReaperSettings,
    ) -> Self {
        Self {
            registry,
            launcher,
            locks,
            settings,
        }
    }

    pub fn settings(&self) -> &ReaperSettings {
        &self.settings
    }

    /// Run one sweep as of `now`.
    ///
    /// Classification happens in a single critical section. The resulting hard
    /// stops run concurrently afterwards, each under its session's operation
    /// lock; sessions whose lock is busy are left for the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let ReaperSettings {
            stall_timeout,
            idle_cleanup,
            ..
        } = self.settings;

        let mut report = SweepReport::default();
        let mut exit_codes = Vec::new();
        self.registry.with_sessions(|sessions| {
            for record in sessions.values_mut() {
                if record.running && record.has_exited_process() {
                    let code = record.process.as_ref().and_then(|p| p.exit_state()).and_then(|s| s.code);
                    record.set_running(false, now);
                    record.set_phase(LifecyclePhase::Stalled, now);
                    record.status_message = match code {
                        Some(code) => format!("Pipeline exited (code {code})"),
                        None => "Pipeline exited".to_string(),
                    };
                    report.exited.push(record.id.clone());
                    exit_codes.push((record.id.clone(), code));
                }

                if record.phase == LifecyclePhase::Terminated {
                    if now - record.last_transition > idle_cleanup {
                        report.expired.push(record.id.clone());
                    }
                } else if now - record.last_client_seen > stall_timeout {
                    report.stalled.push(record.id.clone());
                }
            }
        });

        for (id, code) in exit_codes {
            info!(session_id = %id, ?code, "Pipeline exited");
            self.launcher.emit(SessionEvent::Exited { session_id: id, code });
        }

        let due = report
            .stalled
            .iter()
            .map(|id| (id, StopReason::Stalled))
            .chain(report.expired.iter().map(|id| (id, StopReason::Expired)));

        let mut stops = Vec::new();
        for (id, reason) in due {
            match self.locks.try_acquire(id) {
                Some(guard) => {
                    debug!(session_id = %id, %reason, "Reaping session");
                    stops.push(async move {
                        self.launcher.stop(id, reason, true).await;
                        drop(guard);
                        self.locks.prune(id);
                    });
                }
                None => {
                    debug!(session_id = %id, "Session busy, reaping on next sweep");
                    report.skipped.push(id.clone());
                }
            }
        }
        join_all(stops).await;

        report.stalled.retain(|id| !report.skipped.contains(id));
        report.expired.retain(|id| !report.skipped.contains(id));

        if !report.is_empty() {
            info!(
                exited = report.exited.len(),
                stalled = report.stalled.len(),
                expired = report.expired.len(),
                skipped = report.skipped.len(),
                "Reaper sweep"
            );
        }
        report
    }

    /// Sweep every interval until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Reaper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.sweep(Utc::now()).await;
                        if !report.skipped.is_empty() {
                            warn!(skipped = ?report.skipped, "Reaper skipped busy sessions");
                        }
                    }
                }
            }
        })
    }
}
