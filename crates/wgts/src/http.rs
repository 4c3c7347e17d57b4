//! HTTP front-end for connections the listener classified as HTTP.
//!
//! Every request is rate limited, then either upgraded into the control
//! channel (`/tunnel`) or forwarded to the agent through the proxy bridge.

use crate::channel::{accept_upgrade, is_websocket_upgrade};
use crate::error::RelayError;
use crate::metrics::counters;
use crate::proxy::{forward, text_response};
use crate::ratelimit::Verdict;
use crate::server::Relay;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONNECTION, RETRY_AFTER};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use wgt_common::types::TUNNEL_PATH;

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_WINDOW_MS: HeaderName = HeaderName::from_static("x-ratelimit-window-ms");
static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Serves HTTP/1.1 on one accepted connection until it closes.
///
/// # Errors
///
/// Returns the hyper error that ended the connection, including the
/// deliberate abort of a refused second control channel.
pub async fn serve_http<S>(relay: Arc<Relay>, io: S, peer: SocketAddr) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let header_timeout = relay.config.http_idle_timeout;
    let service = service_fn(move |req| handle_request(Arc::clone(&relay), req, peer));

    http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(header_timeout)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await?;
    Ok(())
}

async fn handle_request(
    relay: Arc<Relay>,
    req: Request<Incoming>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, RelayError> {
    let source = client_ip(&req, peer, relay.config.trust_forwarded);

    let verdict = relay.limiter.check(source);
    if !verdict.is_allowed() {
        tracing::debug!(ip = %source, reason = verdict.reason(), "request rate limited");
        return Ok(too_many_requests(&relay, verdict));
    }

    if is_websocket_upgrade(&req) {
        if req.uri().path().starts_with(TUNNEL_PATH) {
            return accept_upgrade(relay, req, source).await;
        }
        counters::channel_attach_total("wrong_path");
        let mut response = text_response(StatusCode::NOT_FOUND, "Not Found\n");
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        return Ok(response);
    }

    Ok(forward(&relay, req).await)
}

/// Source address of a request: the socket peer, or the first
/// `X-Forwarded-For` entry when the relay sits behind a trusted proxy.
#[must_use]
pub fn client_ip<B>(req: &Request<B>, peer: SocketAddr, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        let forwarded = req
            .headers()
            .get(&X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

/// `429` with advisory retry information.
#[must_use]
pub fn too_many_requests(relay: &Relay, verdict: Verdict) -> Response<Full<Bytes>> {
    let policy = relay.limiter.policy();
    let retry_secs = verdict
        .retry_after()
        .map_or(1, |d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
        .max(1);

    let mut response = text_response(
        StatusCode::TOO_MANY_REQUESTS,
        "Too many requests, try again later.\n",
    );
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_secs));
    headers.insert(
        X_RATELIMIT_LIMIT.clone(),
        HeaderValue::from(policy.max_requests),
    );
    headers.insert(
        X_RATELIMIT_WINDOW_MS.clone(),
        HeaderValue::from(policy.window.as_millis() as u64),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use std::time::Duration;
    use wgt_common::types::KEY_LEN;

    fn relay() -> Relay {
        let config = RelayConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "wgt_0123456789abcdef0123".into(),
            [5u8; KEY_LEN],
        );
        Relay::new(config)
    }

    fn request(forwarded: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = forwarded {
            builder = builder.header("x-forwarded-for", value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn forwarded_header_only_when_trusted() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let req = request(Some("203.0.113.9, 10.0.0.2"));
        assert_eq!(client_ip(&req, peer, false), peer.ip());
        assert_eq!(
            client_ip(&req, peer, true),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn unparsable_forwarded_header_falls_back_to_peer() {
        let peer: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(client_ip(&request(Some("garbage")), peer, true), peer.ip());
        assert_eq!(client_ip(&request(None), peer, true), peer.ip());
    }

    #[test]
    fn rate_limit_response_headers() {
        let relay = relay();
        let resp = too_many_requests(
            &relay,
            Verdict::Banned {
                retry_after: Duration::from_millis(2500),
            },
        );
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["retry-after"], "3");
        assert_eq!(resp.headers()["x-ratelimit-limit"], "100");
        assert_eq!(resp.headers()["x-ratelimit-window-ms"], "60000");
    }

    #[test]
    fn retry_after_is_at_least_one_second() {
        let relay = relay();
        let resp = too_many_requests(
            &relay,
            Verdict::GlobalBan {
                retry_after: Duration::ZERO,
            },
        );
        assert_eq!(resp.headers()["retry-after"], "1");
    }
}
