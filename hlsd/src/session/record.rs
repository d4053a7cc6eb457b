//! Session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::launcher::{PipelineProcess, PipelineStrategy};
use crate::progress::PollerHandle;
use crate::resolver::ProgressSnapshot;

/// Where a session is in its lifecycle.
///
/// `Initializing → Launching → Running ⇄ Stalled → Restarting → Launching`;
/// `Terminated` is left only through a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Admitted; the slot is held but nothing has been launched yet.
    Initializing,
    /// Analysis and process spawn in progress.
    Launching,
    /// The pipeline process is alive.
    Running,
    /// The pipeline exited on its own while the client may still be watching.
    Stalled,
    /// The previous pipeline is being replaced by a resumed one.
    Restarting,
    /// Stopped. Artifacts may still be retained for a restart.
    Terminated,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Restarting => "restarting",
            Self::Terminated => "terminated",
        }
    }

    /// Phases that claim the content for this session.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launching | Self::Running | Self::Restarting)
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a session streams. Immutable once the session is admitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentContext {
    /// Magnet URI or direct URL of the content.
    pub locator: String,
    /// Index of the primary media file within the content.
    pub index: u32,
    /// Index of the selected subtitle file, if any.
    pub subtitle_index: Option<u32>,
}

impl ContentContext {
    pub fn new(locator: impl Into<String>, index: u32, subtitle_index: Option<u32>) -> Self {
        Self {
            locator: locator.into(),
            index,
            subtitle_index,
        }
    }

    /// Whether the content is fetched through the remote swarm rather than a plain URL.
    pub fn is_remote_content(&self) -> bool {
        self.locator.starts_with("magnet:")
    }
}

/// Observed state of the pipeline process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    /// No process has been started (or it was stopped and released).
    None,
    Alive { pid: u32 },
    /// `code` is `None` when the process was ended by a signal.
    Exited { code: Option<i32> },
}

/// One active or recently active session.
///
/// Owned by the registry. The process and poller handles never leave it except
/// through [`PipelineLauncher`](crate::launcher::PipelineLauncher), so readers
/// only ever see a [`SessionSnapshot`].
pub struct SessionRecord {
    pub id: String,
    pub phase: LifecyclePhase,
    pub context: ContentContext,
    pub(crate) process: Option<PipelineProcess>,
    /// Claims a concurrency slot. Set before the process exists, reconciled by the reaper.
    pub running: bool,
    pub last_client_seen: DateTime<Utc>,
    /// Last change of `running` or `phase`.
    pub last_transition: DateTime<Utc>,
    pub progress: ProgressSnapshot,
    pub(crate) poller: Option<PollerHandle>,
    pub status_message: String,
    /// Strategy of the most recent launch, reused on restart.
    pub strategy: Option<PipelineStrategy>,
    /// Bumped on every admission and restart; stale launches compare against it.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A freshly admitted record: slot claimed, nothing launched.
    pub fn admitted(
        id: impl Into<String>,
        context: ContentContext,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            phase: LifecyclePhase::Initializing,
            context,
            process: None,
            running: true,
            last_client_seen: now,
            last_transition: now,
            progress: ProgressSnapshot::default(),
            poller: None,
            status_message: "Initializing...".to_string(),
            strategy: None,
            generation,
            created_at: now,
        }
    }

    pub fn set_phase(&mut self, phase: LifecyclePhase, now: DateTime<Utc>) {
        if self.phase != phase {
            self.phase = phase;
            self.last_transition = now;
        }
    }

    pub fn set_running(&mut self, running: bool, now: DateTime<Utc>) {
        if self.running != running {
            self.running = running;
            self.last_transition = now;
        }
    }

    pub fn process_state(&self) -> ProcessState {
        match &self.process {
            None => ProcessState::None,
            Some(process) => match process.exit_state() {
                Some(exit) => ProcessState::Exited { code: exit.code },
                None => ProcessState::Alive { pid: process.pid() },
            },
        }
    }

    /// A handle whose process has exited. A missing handle is not "exited".
    pub fn has_exited_process(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.has_exited())
    }

    /// Holding a slot and not known to be dead.
    pub fn is_live(&self) -> bool {
        self.running && !self.has_exited_process()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            phase: self.phase,
            context: self.context.clone(),
            running: self.running,
            process: self.process_state(),
            last_client_seen: self.last_client_seen,
            last_transition: self.last_transition,
            progress: self.progress.clone(),
            has_poller: self.poller.is_some(),
            status_message: self.status_message.clone(),
            strategy: self.strategy,
            generation: self.generation,
            created_at: self.created_at,
        }
    }

    /// Move the process and poller handles out, leaving the record handle-free.
    pub(crate) fn take_handles(&mut self) -> SessionHandles {
        SessionHandles {
            process: self.process.take(),
            poller: self.poller.take(),
        }
    }
}

impl std::fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRecord")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("locator", &self.context.locator)
            .field("running", &self.running)
            .field("process", &self.process_state())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Handles detached from a record, to be released outside the registry lock.
#[derive(Default)]
pub(crate) struct SessionHandles {
    pub process: Option<PipelineProcess>,
    pub poller: Option<PollerHandle>,
}

impl SessionHandles {
    pub fn is_empty(&self) -> bool {
        self.process.is_none() && self.poller.is_none()
    }
}

/// Point-in-time copy of a [`SessionRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub phase: LifecyclePhase,
    pub context: ContentContext,
    pub running: bool,
    pub process: ProcessState,
    pub last_client_seen: DateTime<Utc>,
    pub last_transition: DateTime<Utc>,
    pub progress: ProgressSnapshot,
    pub has_poller: bool,
    pub status_message: String,
    pub strategy: Option<PipelineStrategy>,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
}
