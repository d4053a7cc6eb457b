//! Session state and its single source of truth.

mod locks;
mod record;
mod registry;

pub(crate) use record::SessionHandles;

pub use locks::SessionLocks;
pub use record::{ContentContext, LifecyclePhase, ProcessState, SessionRecord, SessionSnapshot};
pub use registry::SessionRegistry;
