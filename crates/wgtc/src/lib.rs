//! waitgate agent: holds the control channel to the relay and re-dials
//! forwarded streams against a local service.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Reconnect backoff with jitter.
pub mod backoff;
/// CLI parsing and agent configuration.
pub mod config;
/// Error types for agent sessions.
pub mod error;
/// Local side of multiplexed streams.
pub mod local;
/// Proxied HTTP requests against the local service.
pub mod proxy;
/// Control-channel session and reconnect loop.
pub mod tunnel;

pub use tunnel::{run_agent, ConnStatus};
