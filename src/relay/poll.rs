use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io;
use std::os::fd::BorrowedFd;

use super::status::{Side, Termination};

/// What a single wakeup reported for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Idle,
    Readable,
    Hangup,
    Error,
    Invalid,
}

impl Readiness {
    pub(crate) fn from_revents(revents: PollFlags) -> Self {
        if revents.contains(PollFlags::POLLNVAL) {
            Readiness::Invalid
        } else if revents.contains(PollFlags::POLLERR) {
            Readiness::Error
        } else if revents.contains(PollFlags::POLLHUP) {
            Readiness::Hangup
        } else if revents.contains(PollFlags::POLLIN) {
            Readiness::Readable
        } else {
            Readiness::Idle
        }
    }

    /// Terminal condition carried by this readiness, if any.
    pub(crate) fn termination(self, side: Side) -> Option<Termination> {
        match self {
            Readiness::Invalid => Some(Termination::Invalid { side }),
            Readiness::Error => Some(Termination::EndpointError { side }),
            Readiness::Hangup => Some(Termination::Hangup { side }),
            Readiness::Idle | Readiness::Readable => None,
        }
    }

    pub(crate) fn is_readable(self) -> bool {
        self == Readiness::Readable
    }
}

/// Blocks until either endpoint is readable or reports a terminal condition.
///
/// Interrupted waits are retried. The result is indexed by [`Side::index`].
pub(crate) fn wait_readable(a: BorrowedFd<'_>, b: BorrowedFd<'_>) -> io::Result<[Readiness; 2]> {
    let mut fds = [
        PollFd::new(a, PollFlags::POLLIN),
        PollFd::new(b, PollFlags::POLLIN),
    ];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(fds.map(|fd| Readiness::from_revents(fd.revents().unwrap_or_else(PollFlags::empty))))
}

/// Blocks until `fd` can take more output.
///
/// Error and hangup conditions also end the wait; the write that follows
/// reports the real cause.
pub(crate) fn wait_writable(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
