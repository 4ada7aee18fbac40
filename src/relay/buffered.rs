use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, recv, send};
use std::collections::TryReserveError;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use tracing::trace;

use super::poll::wait_writable;
use super::status::MoveError;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

/// Session-scoped user memory used by the copy path.
pub(crate) struct ScratchBuffer {
    buf: Vec<u8>,
}

impl ScratchBuffer {
    pub(crate) fn allocate(size: usize) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        buf.resize(size, 0);
        Ok(Self { buf })
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Result of one copy-path step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunk {
    Forwarded(usize),
    Eof,
    /// Readiness was reported but nothing could be read.
    Spurious,
}

/// Destination of a drain. Implemented by sockets; tests substitute
/// throttled writers.
pub(crate) trait Sink {
    fn send(&mut self, buf: &[u8]) -> nix::Result<usize>;
    fn writable(&mut self) -> io::Result<()>;
}

impl Sink for BorrowedFd<'_> {
    fn send(&mut self, buf: &[u8]) -> nix::Result<usize> {
        send(self.as_raw_fd(), buf, SEND_FLAGS)
    }

    fn writable(&mut self) -> io::Result<()> {
        wait_writable(*self)
    }
}

/// Reads one chunk from `src` and forwards all of it to `dst`.
pub(crate) fn transfer(
    src: BorrowedFd<'_>,
    mut dst: BorrowedFd<'_>,
    buf: &mut [u8],
) -> Result<Chunk, MoveError> {
    let len = loop {
        match recv(src.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT) {
            Ok(0) => return Ok(Chunk::Eof),
            Ok(n) => break n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(Chunk::Spurious),
            Err(e) => return Err(MoveError::Read(e.into())),
        }
    };
    trace!("copy: read {} bytes", len);
    drain(&mut dst, &buf[..len])?;
    Ok(Chunk::Forwarded(len))
}

/// Writes all of `chunk`, looping over partial writes.
///
/// On failure the unsent tail is dropped.
pub(crate) fn drain<S: Sink>(sink: &mut S, mut chunk: &[u8]) -> Result<(), MoveError> {
    while !chunk.is_empty() {
        match sink.send(chunk) {
            Ok(0) => return Err(MoveError::Write(io::ErrorKind::WriteZero.into())),
            Ok(n) => chunk = &chunk[n..],
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => sink.writable().map_err(MoveError::Wait)?,
            Err(e) => return Err(MoveError::Write(e.into())),
        }
    }
    Ok(())
}
