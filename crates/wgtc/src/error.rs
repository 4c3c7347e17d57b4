use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that end one agent session.
#[derive(Error, Debug)]
pub enum AgentError {
    /// WebSocket transport error on the control channel.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The relay answered the upgrade with `401`.
    #[error("relay rejected the tunnel token")]
    Unauthorized,
    /// The relay answered the upgrade with a non-101 status.
    #[error("relay refused the upgrade with status {0}")]
    Refused(u16),
    /// The token cannot be sent as a header value.
    #[error("tunnel token is not a valid header value")]
    InvalidToken,
    /// The local HTTP client could not be built.
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),
    /// The relay closed the control channel.
    #[error("control channel closed by relay")]
    Closed,
}

impl AgentError {
    /// Errors that will not go away by reconnecting.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::InvalidToken)
    }

    /// Maps a failed handshake onto the relay's answer, when there was one.
    #[must_use]
    pub fn from_handshake(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(resp) if resp.status().as_u16() == 401 => Self::Unauthorized,
            tungstenite::Error::Http(resp) => Self::Refused(resp.status().as_u16()),
            other => Self::WebSocket(other),
        }
    }
}
