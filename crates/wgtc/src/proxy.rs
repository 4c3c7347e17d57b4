//! Answers proxied HTTP requests against the local HTTP service.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use std::time::Duration;
use tracing::{debug, warn};
use wgt_common::envelope::{
    decode_body, encode_body, header_pairs, push_header, ProxyRequest, ProxyResponse, WireHeaders,
};

/// Request headers that describe the relay hop, not the local one.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Forwards proxied requests to one base URL.
#[derive(Clone)]
pub struct LocalHttp {
    client: Client,
    base: String,
}

impl LocalHttp {
    /// Client for `base` (scheme, host and port, no trailing slash).
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// URL the request for `path` is sent to.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base)
        } else {
            format!("{}/{path}", self.base)
        }
    }

    /// Performs `req` and packages the outcome. Failures answer `502`.
    pub async fn answer(&self, req_id: String, req: ProxyRequest) -> ProxyResponse {
        match self.perform(&req).await {
            Ok((status, headers, body)) => ProxyResponse {
                req_id,
                status,
                headers,
                body: encode_body(&body),
            },
            Err(e) => {
                warn!(req_id = %req_id, method = %req.method, path = %req.path, error = %e, "local HTTP request failed");
                bad_gateway(req_id)
            }
        }
    }

    async fn perform(&self, req: &ProxyRequest) -> Result<(u16, WireHeaders, Vec<u8>), ProxyError> {
        let method = Method::from_bytes(req.method.as_bytes()).map_err(|_| ProxyError::Method)?;
        let body = decode_body(req.body.as_deref()).map_err(|_| ProxyError::Body)?;

        let response = self
            .client
            .request(method, self.url_for(&req.path))
            .headers(request_headers(&req.headers))
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let mut headers = WireHeaders::new();
        for (name, value) in response.headers() {
            match value.to_str() {
                Ok(value) => push_header(&mut headers, name.as_str(), value),
                Err(_) => debug!(header = %name, "skipping non-text response header"),
            }
        }
        let body = response.bytes().await?.to_vec();
        Ok((status, headers, body))
    }
}

#[derive(Debug, thiserror::Error)]
enum ProxyError {
    #[error("invalid method")]
    Method,
    #[error("invalid base64 body")]
    Body,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// `502` answer with no body.
#[must_use]
pub fn bad_gateway(req_id: String) -> ProxyResponse {
    ProxyResponse {
        req_id,
        status: 502,
        headers: WireHeaders::new(),
        body: None,
    }
}

/// Converts wire headers, dropping hop-by-hop ones and anything that is not a
/// valid header.
#[must_use]
pub fn request_headers(wire: &WireHeaders) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in header_pairs(wire) {
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
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
    headers
}
