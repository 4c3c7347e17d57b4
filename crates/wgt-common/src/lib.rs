//! Common types and utilities shared by the waitgate relay and agent.
//!
//! This crate provides:
//! - Authenticated frame encryption ([`cipher`])
//! - Control-channel JSON envelopes ([`envelope`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod envelope;
pub mod types;

pub use cipher::{CipherError, FrameCipher};
pub use envelope::{ControlMessage, EnvelopeError};
pub use types::StreamId;
