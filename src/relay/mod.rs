//! Blocking bidirectional relay between two connected stream sockets.
//!
//! This module provides:
//! - [`relay`] / [`Relay`] to run one session over a pair of endpoints
//! - A readiness wait on both endpoints with no timeout
//! - Linux splice() zero-copy transfer through a session-owned pipe
//! - A buffered copy path used whenever splice cannot make progress
//!
//! The call occupies its thread until the session terminates and returns a
//! [`RelayOutcome`] naming the cause. Endpoints are borrowed: the relay never
//! closes them or changes their blocking mode.

mod buffered;
mod poll;
mod splice;
mod status;

pub use status::{RelayOutcome, Side, Termination, TransferStats};

use std::convert::Infallible;
use std::os::fd::{AsFd, BorrowedFd};
use tracing::{debug, trace, warn};

use crate::config::IoParams;
use buffered::{Chunk, ScratchBuffer};
use splice::ZeroCopyMover;

pub const DEFAULT_BUFFER_SIZE: usize = 65536;

/// Relays between `a` and `b` until either side closes or fails.
///
/// `buffer_size` bounds both the copy-path scratch buffer and the chunk
/// attempted per splice; zero is rejected.
///
/// Writes on the splice path cannot pass `MSG_NOSIGNAL`. A write to a closed
/// peer raises `SIGPIPE`, which the Rust runtime ignores by default; hosts
/// that restore the default disposition must ignore it themselves or use
/// [`Relay::disable_splice`].
pub fn relay<A: AsFd, B: AsFd>(a: &A, b: &B, buffer_size: usize) -> RelayOutcome {
    Relay::new(a, b).buffer_size(buffer_size).run()
}

type StatsCallback<'a> = Box<dyn FnMut(usize) + Send + 'a>;

/// Relay session builder with support for:
/// - Buffer size configuration
/// - Disabling the splice path
/// - Per-direction statistics callbacks
pub struct Relay<'a> {
    a: BorrowedFd<'a>,
    b: BorrowedFd<'a>,
    buffer_size: usize,
    use_splice: bool,
    stats_a_to_b: Option<StatsCallback<'a>>,
    stats_b_to_a: Option<StatsCallback<'a>>,
}

impl<'a> Relay<'a> {
    pub fn new<A: AsFd, B: AsFd>(a: &'a A, b: &'a B) -> Self {
        Self {
            a: a.as_fd(),
            b: b.as_fd(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            use_splice: true,
            stats_a_to_b: None,
            stats_b_to_a: None,
        }
    }

    /// Set buffer size for copy operations
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Disable splice optimization
    pub fn disable_splice(mut self) -> Self {
        self.use_splice = false;
        self
    }

    /// Configure from IoParams (buffer size and splice settings)
    pub fn with_io_params(mut self, params: &IoParams) -> Self {
        self.buffer_size = params.buffer_size;
        self.use_splice = params.use_splice;
        self
    }

    /// Set statistics callbacks, called with the size of every forwarded chunk
    pub fn with_stats<F1, F2>(mut self, stats_a_to_b: F1, stats_b_to_a: F2) -> Self
    where
        F1: FnMut(usize) + Send + 'a,
        F2: FnMut(usize) + Send + 'a,
    {
        self.stats_a_to_b = Some(Box::new(stats_a_to_b));
        self.stats_b_to_a = Some(Box::new(stats_b_to_a));
        self
    }

    /// Runs the session to termination.
    ///
    /// With splice enabled the process must ignore `SIGPIPE`; see [`relay`].
    pub fn run(mut self) -> RelayOutcome {
        let mut stats = TransferStats::default();
        let termination = match self.setup() {
            Ok((mut scratch, mut zero_copy)) => {
                debug!(
                    "relay started: buffer={} splice={}",
                    scratch.len(),
                    zero_copy.is_enabled()
                );
                let Err(termination) = self.drive(&mut scratch, &mut zero_copy, &mut stats);
                termination
            }
            Err(termination) => termination,
        };

        if termination.is_graceful() {
            debug!(
                "relay finished: {} a->b={} b->a={}",
                termination, stats.a_to_b, stats.b_to_a
            );
        } else {
            warn!(
                "relay failed: {} cause: {:?} a->b={} b->a={}",
                termination,
                std::error::Error::source(&termination),
                stats.a_to_b,
                stats.b_to_a
            );
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_session(&termination);

        RelayOutcome { termination, stats }
    }

    fn setup(&self) -> Result<(ScratchBuffer, ZeroCopyMover), Termination> {
        if self.buffer_size == 0 {
            return Err(Termination::InvalidBufferSize);
        }
        let scratch = ScratchBuffer::allocate(self.buffer_size).map_err(|e| {
            trace!("scratch allocation failed: {}", e);
            Termination::AllocationFailed {
                size: self.buffer_size,
            }
        })?;
        Ok((scratch, ZeroCopyMover::new(self.buffer_size, self.use_splice)))
    }

    fn endpoint(&self, side: Side) -> BorrowedFd<'a> {
        match side {
            Side::A => self.a,
            Side::B => self.b,
        }
    }

    fn drive(
        &mut self,
        scratch: &mut ScratchBuffer,
        zero_copy: &mut ZeroCopyMover,
        stats: &mut TransferStats,
    ) -> Result<Infallible, Termination> {
        loop {
            let ready = poll::wait_readable(self.a, self.b).map_err(Termination::WaitFailed)?;
            for side in Side::BOTH {
                if let Some(termination) = ready[side.index()].termination(side) {
                    return Err(termination);
                }
            }
            for side in Side::BOTH {
                if ready[side.index()].is_readable() {
                    self.transfer(side, scratch, zero_copy, stats)?;
                }
            }
        }
    }

    /// Moves one chunk away from `from`: splice first, copy when that
    /// makes no progress.
    fn transfer(
        &mut self,
        from: Side,
        scratch: &mut ScratchBuffer,
        zero_copy: &mut ZeroCopyMover,
        stats: &mut TransferStats,
    ) -> Result<(), Termination> {
        let src = self.endpoint(from);
        let dst = self.endpoint(from.peer());

        if let Some(len) = zero_copy
            .transfer(src, dst)
            .map_err(|e| e.into_termination(from))?
        {
            self.record(from, len, true, stats);
            return Ok(());
        }

        match buffered::transfer(src, dst, scratch.as_mut_slice())
            .map_err(|e| e.into_termination(from))?
        {
            Chunk::Forwarded(len) => {
                self.record(from, len, false, stats);
                Ok(())
            }
            Chunk::Eof => Err(Termination::Closed { side: from }),
            Chunk::Spurious => Ok(()),
        }
    }

    fn record(&mut self, from: Side, len: usize, spliced: bool, stats: &mut TransferStats) {
        stats.add(from, len, spliced);
        let callback = match from {
            Side::A => self.stats_a_to_b.as_mut(),
            Side::B => self.stats_b_to_a.as_mut(),
        };
        if let Some(callback) = callback {
            callback(len);
        }
        #[cfg(feature = "metrics")]
        crate::metrics::record_bytes(from, len, spliced);
    }
}
