//! waitgate relay server: exposes a private-network service by multiplexing
//! public TCP and HTTP traffic over one authenticated agent tunnel.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Control-channel slot, upgrade handling and message loop.
pub mod channel;
/// CLI argument parsing and relay configuration.
pub mod config;
/// Error types for relay operations.
pub mod error;
/// HTTP/1.1 front-end.
pub mod http;
/// First-bytes classification of public connections.
pub mod listener;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Stream multiplexer.
pub mod mux;
/// HTTP proxy bridge and request correlation.
pub mod proxy;
/// Per-source rate limiting and bans.
pub mod ratelimit;
/// Relay state and accept loop.
pub mod server;

pub use server::{run, run_with_shutdown, Relay};
