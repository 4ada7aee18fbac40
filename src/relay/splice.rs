//! Zero-copy data path.
//!
//! Bytes move source -> pipe -> destination with `splice(2)`, never entering
//! user memory. The pipe (the conduit) belongs to a single session: it is
//! opened on first use and closed when the session drops the mover.

#[cfg(not(target_os = "linux"))]
use std::os::fd::BorrowedFd;

use super::status::MoveError;

#[cfg(target_os = "linux")]
pub(crate) use linux::ZeroCopyMover;

#[cfg(not(target_os = "linux"))]
pub(crate) struct ZeroCopyMover;

#[cfg(not(target_os = "linux"))]
impl ZeroCopyMover {
    pub(crate) fn new(_chunk: usize, _enabled: bool) -> Self {
        ZeroCopyMover
    }

    pub(crate) fn is_enabled(&self) -> bool {
        false
    }

    pub(crate) fn transfer(
        &mut self,
        _src: BorrowedFd<'_>,
        _dst: BorrowedFd<'_>,
    ) -> Result<Option<usize>, MoveError> {
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use nix::errno::Errno;
    use nix::fcntl::{FcntlArg, OFlag, SpliceFFlags, fcntl, splice};
    use nix::unistd::pipe2;
    use std::io;
    use std::os::fd::{BorrowedFd, OwnedFd};
    use tracing::{trace, warn};

    use super::super::poll::wait_writable;
    use super::MoveError;

    const FLAGS: SpliceFFlags = SpliceFFlags::SPLICE_F_MOVE.union(SpliceFFlags::SPLICE_F_NONBLOCK);

    /// Pipe pair used as the in-kernel intermediary.
    pub(crate) struct Conduit {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl Conduit {
        pub(crate) fn open(capacity: usize) -> io::Result<Self> {
            let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
            // Best effort; the kernel may cap or round the size.
            if let Ok(size) = libc::c_int::try_from(capacity)
                && let Err(e) = fcntl(&write, FcntlArg::F_SETPIPE_SZ(size))
            {
                trace!("conduit: keeping default pipe size: {}", e);
            }
            Ok(Conduit { read, write })
        }
    }

    pub(crate) struct ZeroCopyMover {
        chunk: usize,
        enabled: bool,
        conduit: Option<Conduit>,
    }

    impl ZeroCopyMover {
        pub(crate) fn new(chunk: usize, enabled: bool) -> Self {
            ZeroCopyMover {
                chunk,
                enabled,
                conduit: None,
            }
        }

        pub(crate) fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn conduit(&mut self) -> Option<&Conduit> {
            if self.conduit.is_none() {
                match Conduit::open(self.chunk) {
                    Ok(conduit) => self.conduit = Some(conduit),
                    Err(e) => {
                        warn!("splice disabled, cannot open pipe: {}", e);
                        self.enabled = false;
                        return None;
                    }
                }
            }
            self.conduit.as_ref()
        }

        fn disable(&mut self, cause: Errno) {
            warn!("splice disabled for this session: {}", cause);
            self.enabled = false;
            self.conduit = None;
        }

        /// Moves up to one chunk from `src` to `dst`.
        ///
        /// `Ok(None)` means no progress; the caller falls back to the copy
        /// path, which also tells EOF apart from a transient condition.
        pub(crate) fn transfer(
            &mut self,
            src: BorrowedFd<'_>,
            dst: BorrowedFd<'_>,
        ) -> Result<Option<usize>, MoveError> {
            if !self.enabled {
                return Ok(None);
            }
            let chunk = self.chunk;
            let Some(conduit) = self.conduit() else {
                return Ok(None);
            };
            match splice(src, None, &conduit.write, None, chunk, FLAGS) {
                Ok(0) => Ok(None),
                Ok(len) => {
                    trace!("splice: {} bytes into conduit", len);
                    drain(conduit, dst, len)?;
                    Ok(Some(len))
                }
                Err(Errno::EAGAIN | Errno::EINTR) => Ok(None),
                Err(e @ (Errno::EINVAL | Errno::ENOSYS | Errno::EOPNOTSUPP)) => {
                    self.disable(e);
                    Ok(None)
                }
                // A failed splice consumes the pending socket error, so the
                // copy path would only see EOF afterwards.
                Err(e) => Err(MoveError::Read(e.into())),
            }
        }
    }

    /// Empties `pending` bytes out of the conduit into `dst`.
    ///
    /// Bytes already in the pipe cannot be handed back, so a failure here
    /// ends the session.
    fn drain(conduit: &Conduit, dst: BorrowedFd<'_>, mut pending: usize) -> Result<(), MoveError> {
        while pending > 0 {
            match splice(&conduit.read, None, dst, None, pending, FLAGS) {
                Ok(0) => return Err(MoveError::Write(io::ErrorKind::WriteZero.into())),
                Ok(n) => pending -= n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => wait_writable(dst).map_err(MoveError::Wait)?,
                Err(e) => return Err(MoveError::Write(e.into())),
            }
        }
        Ok(())
    }

}
