//! Listener demultiplexer.
//!
//! Inspects the first bytes of each public connection without consuming
//! them. Anything starting with an HTTP request line goes to the HTTP
//! front-end; everything else becomes a multiplexed stream when an agent is
//! attached and is closed otherwise.

use crate::error::RelayError;
use crate::http::serve_http;
use crate::metrics::counters;
use crate::server::Relay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const HTTP_METHODS: &[&[u8]] = &[
    b"GET", b"POST", b"PUT", b"DELETE", b"HEAD", b"OPTIONS", b"PATCH", b"CONNECT", b"TRACE",
];

/// Longest method plus the separating space.
const PROBE_LEN: usize = 8;

/// Pause between peeks while the prefix is still ambiguous.
const REPEEK_DELAY: Duration = Duration::from_millis(5);

/// Classification of a connection prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Starts with `METHOD SP`.
    Http,
    /// Cannot be an HTTP request line.
    Raw,
    /// Too short to tell.
    NeedMore,
}

/// Classifies the first bytes of a connection.
#[must_use]
pub fn sniff(prefix: &[u8]) -> Sniff {
    let mut ambiguous = prefix.is_empty();
    for method in HTTP_METHODS {
        let n = method.len();
        if prefix.len() > n {
            if prefix.starts_with(method) && prefix[n] == b' ' {
                return Sniff::Http;
            }
        } else if method.starts_with(prefix) {
            ambiguous = true;
        }
    }
    if ambiguous {
        Sniff::NeedMore
    } else {
        Sniff::Raw
    }
}

/// Waits for enough bytes to classify `stream`.
///
/// Returns `None` if the peer closed before sending anything. A prefix that
/// stays ambiguous until `wait` elapses is treated as raw.
async fn classify(stream: &TcpStream, wait: Duration) -> std::io::Result<Option<Sniff>> {
    let mut probe = [0u8; PROBE_LEN];
    let deadline = tokio::time::Instant::now() + wait;
    let mut seen = 0;
    loop {
        let peeked = tokio::time::timeout_at(deadline, stream.peek(&mut probe)).await;
        let n = match peeked {
            Ok(result) => result?,
            Err(_) if seen > 0 => return Ok(Some(Sniff::Raw)),
            Err(_) => return Ok(None),
        };
        if n == 0 {
            return Ok(None);
        }
        seen = n;
        match sniff(&probe[..n]) {
            Sniff::NeedMore if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(REPEEK_DELAY).await;
            }
            Sniff::NeedMore => return Ok(Some(Sniff::Raw)),
            decided => return Ok(Some(decided)),
        }
    }
}

/// Routes one accepted public connection.
///
/// # Errors
///
/// Returns I/O errors from the first read, HTTP serving errors, or
/// [`RelayError::InitBufferOverflow`] if the first read alone is too large.
pub async fn demux(relay: Arc<Relay>, mut stream: TcpStream, peer: SocketAddr) -> Result<(), RelayError> {
    let standing = relay.limiter.standing(peer.ip());
    if !standing.is_allowed() {
        counters::connections_total("rejected");
        tracing::debug!(ip = %peer.ip(), reason = standing.reason(), "source rejected on accept");
        return Ok(());
    }

    let Some(kind) = classify(&stream, relay.config.http_idle_timeout).await? else {
        counters::connections_total("empty");
        return Ok(());
    };

    if kind == Sniff::Http {
        counters::connections_total("http");
        return serve_http(relay, stream, peer).await;
    }

    let verdict = relay.limiter.check(peer.ip());
    if !verdict.is_allowed() {
        counters::connections_total("rate_limited");
        tracing::debug!(ip = %peer.ip(), reason = verdict.reason(), "raw connection rate limited");
        return Ok(());
    }

    let Some(outbound) = relay.channel.sender() else {
        counters::connections_total("no_channel");
        tracing::debug!(ip = %peer.ip(), "raw connection with no agent attached, closing");
        return Ok(());
    };

    let mut initial = vec![0u8; relay.config.stream.read_chunk];
    let n = stream.read(&mut initial).await?;
    if n == 0 {
        return Err(RelayError::ConnectionClosed);
    }
    initial.truncate(n);

    counters::connections_total("stream");
    let id = relay.mux.open_stream(stream, initial, outbound)?;
    tracing::debug!(stream_id = id, ip = %peer.ip(), "forwarding raw connection");
    Ok(())
}
