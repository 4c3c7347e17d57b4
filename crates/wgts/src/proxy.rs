//! HTTP proxy bridge: forwards a buffered HTTP request to the agent and
//! waits for the correlated response.

use crate::metrics::{counters, histograms};
use crate::server::Relay;
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use rand::rngs::OsRng;
use rand::Rng;
use tokio::sync::oneshot;
use wgt_common::envelope::{
    decode_body, encode_body, header_pairs, push_header, ProxyRequest, ProxyResponse, WireHeaders,
};
use wgt_common::ControlMessage;

/// Headers describing the agent-side framing, recomputed by the front-end.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Correlation table of requests waiting for an agent response.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiting: DashMap<String, oneshot::Sender<ProxyResponse>>,
}

impl PendingRequests {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `req_id` and returns the receiver its response will arrive on.
    pub fn register(&self, req_id: &str) -> oneshot::Receiver<ProxyResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(req_id.to_owned(), tx);
        rx
    }

    /// Completes a pending request. Returns `false` if nobody is waiting for
    /// `resp.req_id` any more.
    pub fn respond(&self, resp: ProxyResponse) -> bool {
        match self.waiting.remove(&resp.req_id) {
            Some((_, tx)) => tx.send(resp).is_ok(),
            None => false,
        }
    }

    /// Drops a pending request without answering it.
    pub fn cancel(&self, req_id: &str) -> bool {
        self.waiting.remove(req_id).is_some()
    }

    /// Drops every pending request. Returns how many were waiting.
    pub fn cancel_all(&self) -> usize {
        let count = self.waiting.len();
        self.waiting.clear();
        count
    }

    /// Number of requests waiting for a response.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    /// Returns `true` if no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

/// Deregisters a correlation when the waiting handler goes away, whether it
/// completed, timed out or the client disconnected.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    req_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(&self.req_id);
    }
}

/// Generates a fresh correlation id.
#[must_use]
pub fn new_req_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill(&mut raw);
    hex::encode(raw)
}

/// Forwards `req` to the agent and turns its answer into the response.
pub async fn forward(relay: &Relay, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(tx) = relay.channel.sender() else {
        counters::proxy_requests_total("no_channel");
        return relay.fallback_response();
    };

    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, relay.config.max_body).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            counters::proxy_requests_total("too_large");
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large\n");
        }
        Err(e) => {
            tracing::debug!(error = %e, "failed to read request body");
            counters::proxy_requests_total("bad_request");
            return text_response(StatusCode::BAD_REQUEST, "Bad Request\n");
        }
    };

    let mut headers = WireHeaders::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            push_header(&mut headers, name.as_str(), value);
        }
    }
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_owned(), |pq| pq.as_str().to_owned());

    let req_id = new_req_id();
    let rx = relay.pending.register(&req_id);
    let _guard = PendingGuard {
        pending: &relay.pending,
        req_id: req_id.clone(),
    };

    tracing::debug!(req_id = %req_id, method = %parts.method, path = %path, "proxying request");
    let msg = ControlMessage::HttpProxy {
        req_id,
        req: ProxyRequest {
            method: parts.method.as_str().to_owned(),
            path,
            headers,
            body: encode_body(&body),
        },
    };
    let started = std::time::Instant::now();
    if tx.send(msg).await.is_err() {
        counters::proxy_requests_total("channel_closed");
        return relay.fallback_response();
    }

    match tokio::time::timeout(relay.config.proxy_timeout, rx).await {
        Ok(Ok(resp)) => {
            counters::proxy_requests_total("ok");
            histograms::proxy_latency_seconds(started.elapsed().as_secs_f64());
            build_response(resp)
        }
        Ok(Err(_)) => {
            counters::proxy_requests_total("channel_closed");
            text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n")
        }
        Err(_) => {
            counters::proxy_requests_total("timeout");
            text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout\n")
        }
    }
}

/// Converts an agent response into an HTTP response.
///
/// Invalid statuses or bodies yield `502`; unrepresentable headers are
/// skipped.
#[must_use]
pub fn build_response(resp: ProxyResponse) -> Response<Full<Bytes>> {
    let Ok(status) = StatusCode::from_u16(resp.status) else {
        tracing::warn!(req_id = %resp.req_id, status = resp.status, "agent sent invalid status");
        return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
    };
    let body = match decode_body(resp.body.as_deref()) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(req_id = %resp.req_id, error = %e, "agent sent invalid body");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway\n");
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in header_pairs(&resp.headers) {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    response
}

/// Plain-text response with the given status.
#[must_use]
pub fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
