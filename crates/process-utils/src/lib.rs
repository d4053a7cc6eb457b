//! Process helpers shared across the workspace.
//!
//! A media pipeline is usually several cooperating child processes (a decoder
//! feeding a segmenter through a pipe). Every stage of one pipeline is placed in
//! a single process group so the whole pipeline can be signalled at once, see
//! [`signal_group`].

use std::ffi::OsStr;

mod group;

pub use group::{GroupSignal, signal_group};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Spawn options applied to every pipeline stage.
pub trait SpawnExt {
    /// Apply the Windows `CREATE_NO_WINDOW` flag. No-op on other targets.
    fn no_window(&mut self) -> &mut Self;

    /// Place the child in process group `pgid`.
    ///
    /// `0` starts a new group led by the child itself. No-op on non-Unix targets.
    fn in_process_group(&mut self, pgid: u32) -> &mut Self;
}

impl SpawnExt for std::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
        self
    }

    fn in_process_group(&mut self, pgid: u32) -> &mut Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            self.process_group(pgid as i32);
        }
        #[cfg(not(unix))]
        let _ = pgid;
        self
    }
}

#[cfg(feature = "tokio")]
impl SpawnExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        self.as_std_mut().no_window();
        self
    }

    fn in_process_group(&mut self, pgid: u32) -> &mut Self {
        self.as_std_mut().in_process_group(pgid);
        self
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a `tokio::process::Command` for a pipeline stage.
///
/// The child is killed if its handle is dropped without being waited on, so a
/// panicking owner never leaks a running encoder.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}
