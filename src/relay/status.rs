use std::fmt;
use std::io;

/// One of the two endpoints of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub(crate) const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    /// Label of the direction that carries bytes read from this side.
    pub fn direction(self) -> &'static str {
        match self {
            Side::A => "a_to_b",
            Side::B => "b_to_a",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => f.write_str("a"),
            Side::B => f.write_str("b"),
        }
    }
}

/// Why a relay session ended.
///
/// A session ends exactly once. `Closed` and `Hangup` are the orderly
/// outcomes; everything else is a fault or a setup failure.
#[derive(Debug, thiserror::Error)]
pub enum Termination {
    #[error("endpoint {side} closed")]
    Closed { side: Side },
    #[error("endpoint {side} hung up")]
    Hangup { side: Side },
    #[error("endpoint {side} reported an error")]
    EndpointError { side: Side },
    #[error("endpoint {side} is not a valid descriptor")]
    Invalid { side: Side },
    #[error("read from endpoint {side} failed")]
    ReadFailed {
        side: Side,
        #[source]
        source: io::Error,
    },
    #[error("write to endpoint {side} failed")]
    WriteFailed {
        side: Side,
        #[source]
        source: io::Error,
    },
    #[error("readiness wait failed")]
    WaitFailed(#[source] io::Error),
    #[error("cannot allocate a {size} byte scratch buffer")]
    AllocationFailed { size: usize },
    #[error("buffer size must be greater than zero")]
    InvalidBufferSize,
}

impl Termination {
    pub fn is_graceful(&self) -> bool {
        matches!(self, Termination::Closed { .. } | Termination::Hangup { .. })
    }

    /// True when the session never entered its relay loop.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Termination::AllocationFailed { .. } | Termination::InvalidBufferSize
        )
    }

    /// The endpoint the condition was observed on, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            Termination::Closed { side }
            | Termination::Hangup { side }
            | Termination::EndpointError { side }
            | Termination::Invalid { side }
            | Termination::ReadFailed { side, .. }
            | Termination::WriteFailed { side, .. } => Some(*side),
            Termination::WaitFailed(_)
            | Termination::AllocationFailed { .. }
            | Termination::InvalidBufferSize => None,
        }
    }

    /// Short stable label, used for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Termination::Closed { .. } => "closed",
            Termination::Hangup { .. } => "hangup",
            Termination::EndpointError { .. } => "endpoint_error",
            Termination::Invalid { .. } => "invalid",
            Termination::ReadFailed { .. } => "read_failed",
            Termination::WriteFailed { .. } => "write_failed",
            Termination::WaitFailed(_) => "wait_failed",
            Termination::AllocationFailed { .. } => "allocation_failed",
            Termination::InvalidBufferSize => "invalid_buffer_size",
        }
    }
}

/// Byte counters of a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// Portion of the total that went through the zero-copy path.
    pub spliced: u64,
}

impl TransferStats {
    pub fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }

    pub(crate) fn add(&mut self, from: Side, len: usize, spliced: bool) {
        let len = len as u64;
        match from {
            Side::A => self.a_to_b += len,
            Side::B => self.b_to_a += len,
        }
        if spliced {
            self.spliced += len;
        }
    }
}

/// Terminal status returned by a relay call.
#[derive(Debug)]
pub struct RelayOutcome {
    pub termination: Termination,
    pub stats: TransferStats,
}

impl RelayOutcome {
    pub fn is_graceful(&self) -> bool {
        self.termination.is_graceful()
    }
}

/// Failure inside one mover step, before it is attributed to an endpoint.
#[derive(Debug)]
pub(crate) enum MoveError {
    Read(io::Error),
    Write(io::Error),
    Wait(io::Error),
}

impl MoveError {
    pub(crate) fn into_termination(self, from: Side) -> Termination {
        match self {
            MoveError::Read(source) => Termination::ReadFailed { side: from, source },
            MoveError::Write(source) => Termination::WriteFailed {
                side: from.peer(),
                source,
            },
            MoveError::Wait(source) => Termination::WaitFailed(source),
        }
    }
}
