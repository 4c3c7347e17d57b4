//! Core type definitions and protocol constants for the waitgate tunnel.

/// Identifier of one multiplexed stream on the control channel.
///
/// `0` is reserved: envelopes carrying it are ignored.
pub type StreamId = u32;

/// Length of the random nonce prefixed to every encrypted frame.
pub const NONCE_LEN: usize = 12;

/// Length of the Poly1305 authentication tag suffixed to every encrypted frame.
pub const TAG_LEN: usize = 16;

/// Length of the shared ChaCha20-Poly1305 key.
pub const KEY_LEN: usize = 32;

/// Smallest well-formed frame: nonce and tag around an empty ciphertext.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

/// HTTP path the agent upgrades to open the control channel.
pub const TUNNEL_PATH: &str = "/tunnel";

/// Envelope `type` values carried on the control channel.
pub mod message_type {
    /// Relay → agent: forward one buffered HTTP request.
    pub const HTTP_PROXY: &str = "http-proxy";
    /// Agent → relay: report the agent's externally observed address.
    pub const HELLO: &str = "HELLO";
    /// Either direction: the sender's side of a stream has ended.
    pub const CLOSE: &str = "close";
}
