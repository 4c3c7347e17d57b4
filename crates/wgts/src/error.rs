use thiserror::Error;
use wgt_common::StreamId;

/// Errors that can occur during relay server operation.
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket transport error on the control channel.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP front-end error.
    #[error("http error: {0}")]
    Hyper(#[from] hyper::Error),
    /// Frame encryption or authentication failure.
    #[error("cipher error: {0}")]
    Cipher(#[from] wgt_common::CipherError),
    /// Malformed control-channel envelope.
    #[error("envelope error: {0}")]
    Envelope(#[from] wgt_common::EnvelopeError),
    /// An agent tried to attach while another channel is active.
    #[error("a control channel is already active")]
    ChannelBusy,
    /// The control channel went away while a message was queued.
    #[error("control channel closed")]
    ChannelClosed,
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// Bytes buffered before the first flush exceeded the ceiling.
    #[error("stream {id}: initial buffer exceeds {limit} bytes")]
    InitBufferOverflow {
        /// Stream that overflowed (0 when rejected before registration).
        id: StreamId,
        /// Configured ceiling.
        limit: usize,
    },
}
