//! hlsd: session orchestration for on-demand HLS streaming.
//!
//! A client asks for a piece of content; the orchestrator admits a session,
//! launches an external pipeline that writes chunks and a manifest into the
//! session's directory, keeps content progress up to date, and reclaims the
//! session once the client stops watching.
//!
//! The request layer in front of this crate is expected to call into
//! [`SessionOrchestrator`] and serve the session directories as static files.

pub mod admission;
pub mod artifacts;
pub mod config;
pub mod error;
pub mod events;
pub mod launcher;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod reaper;
pub mod resolver;
pub mod restart;
pub mod session;

pub use admission::{Admission, RejectReason};
pub use artifacts::{ArtifactStore, ResumePoint};
pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use events::{SessionEvent, StopReason};
pub use launcher::{PipelineStrategy, PipelineTool, StrategyPolicy};
pub use orchestrator::{ActivityReport, SessionOrchestrator};
pub use resolver::{ContentFile, ContentResolver, ProgressSnapshot};
pub use session::{ContentContext, LifecyclePhase, SessionSnapshot};
