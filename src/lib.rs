//! splice-relay
//!
//! A blocking, bidirectional byte relay between two connected stream
//! sockets. Each session tries Linux splice() through a session-owned pipe
//! and falls back to a buffered copy, and reports why it ended.
//!
//! The [`server`] module is a small TCP forwarder that runs one relay per
//! accepted connection.

#[cfg(not(unix))]
compile_error!("splice-relay requires a unix platform");

pub mod cli;
pub mod config;
pub mod relay;
pub mod server;

#[cfg(feature = "metrics")]
pub mod metrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::{Config, IoParams};
pub use relay::{Relay, RelayOutcome, Side, Termination, TransferStats, relay};
pub use server::ForwardServer;
