//! Process-group signalling.

use std::io;

/// Signal sent to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// Ask every member to exit (`SIGTERM`).
    Terminate,
    /// Kill every member immediately (`SIGKILL`).
    Kill,
}

/// Deliver `signal` to every process in group `pgid`.
///
/// Returns `Ok(true)` when the signal was delivered and `Ok(false)` when the
/// group no longer exists. A `pgid` of 0 is rejected: it would address the
/// caller's own group.
#[cfg(unix)]
pub fn signal_group(pgid: u32, signal: GroupSignal) -> io::Result<bool> {
    if pgid == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "refusing to signal process group 0",
        ));
    }
    let pgid = i32::try_from(pgid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "process group id out of range"))?;

    let signo = match signal {
        GroupSignal::Terminate => libc::SIGTERM,
        GroupSignal::Kill => libc::SIGKILL,
    };

    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pgid, signo) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Process groups are a Unix concept; callers fall back to killing children directly.
#[cfg(not(unix))]
pub fn signal_group(_pgid: u32, _signal: GroupSignal) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process group signalling is only available on unix",
    ))
}
