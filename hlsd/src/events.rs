//! Session lifecycle events.

use serde::Serialize;

use crate::artifacts::ResumePoint;

/// Why a session was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The client asked for it.
    ClientRequest,
    /// Another session claimed the same content.
    Preempted,
    /// A new start request reused the session id.
    Replaced,
    /// The client stopped sending heartbeats.
    Stalled,
    /// A stopped session outlived its retention horizon.
    Expired,
    /// The process is being replaced by a resumed one.
    Restart,
    Shutdown,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRequest => "client_request",
            Self::Preempted => "preempted",
            Self::Replaced => "replaced",
            Self::Stalled => "stalled",
            Self::Expired => "expired",
            Self::Restart => "restart",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broadcast to every subscriber of the orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Admitted {
        session_id: String,
        locator: String,
    },
    /// `evicted` lost its content claim to `session_id`.
    Preempted {
        session_id: String,
        evicted: String,
    },
    Rejected {
        session_id: String,
        running: usize,
        cap: usize,
    },
    Running {
        session_id: String,
        pid: u32,
    },
    LaunchFailed {
        session_id: String,
        reason: String,
    },
    /// The pipeline exited without being asked to.
    Exited {
        session_id: String,
        code: Option<i32>,
    },
    Stopped {
        session_id: String,
        reason: StopReason,
        cleanup: bool,
    },
    Restarting {
        session_id: String,
        resume: ResumePoint,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Admitted { session_id, .. }
            | Self::Preempted { session_id, .. }
            | Self::Rejected { session_id, .. }
            | Self::Running { session_id, .. }
            | Self::LaunchFailed { session_id, .. }
            | Self::Exited { session_id, .. }
            | Self::Stopped { session_id, .. }
            | Self::Restarting { session_id, .. } => session_id,
        }
    }
}
