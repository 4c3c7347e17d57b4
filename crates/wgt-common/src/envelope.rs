//! JSON envelopes exchanged over the control channel.
//!
//! The control channel carries one JSON object per WebSocket text message.
//! Objects with a `type` field are typed messages (`http-proxy`, `HELLO`,
//! `close`); untyped objects are either proxy responses (they carry a
//! `reqId`) or stream data (`id` + base64 `data`).

use crate::types::{message_type, StreamId};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The message is not JSON or matches no known envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// A `data` or `body` field is not valid base64.
    #[error("invalid base64 payload")]
    Base64(#[from] base64::DecodeError),
}

/// Header map as sent on the wire: values are strings, or arrays for
/// repeated headers. Other JSON scalars are tolerated on input.
pub type WireHeaders = Map<String, Value>;

/// One encrypted chunk of a multiplexed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    /// Stream the chunk belongs to.
    pub id: StreamId,
    /// Base64 of `nonce ‖ ciphertext ‖ tag`.
    pub data: String,
}

impl DataFrame {
    /// Wraps an already-encrypted frame for stream `id`.
    #[must_use]
    pub fn new(id: StreamId, frame: &[u8]) -> Self {
        Self {
            id,
            data: STANDARD.encode(frame),
        }
    }

    /// Decodes the base64 payload back into the encrypted frame.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Base64`] when `data` is not valid base64.
    pub fn frame(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(STANDARD.decode(&self.data)?)
    }
}

/// HTTP request forwarded from the relay to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Path and query as received by the relay.
    pub path: String,
    /// Request headers with lowercase names.
    #[serde(default)]
    pub headers: WireHeaders,
    /// Base64 request body, absent when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// HTTP response returned by the agent for a [`ProxyRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    /// Correlation id copied from the request.
    #[serde(rename = "reqId")]
    pub req_id: String,
    /// Response status; `200` when omitted.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: WireHeaders,
    /// Base64 response body, absent when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

const fn default_status() -> u16 {
    200
}

/// A parsed control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Encrypted stream data, either direction.
    Data(DataFrame),
    /// The sender's side of stream `id` has ended.
    Close {
        /// Stream that ended.
        id: StreamId,
    },
    /// Relay → agent: forward one HTTP request.
    HttpProxy {
        /// Correlation id the response must echo.
        req_id: String,
        /// The buffered request.
        req: ProxyRequest,
    },
    /// Agent → relay: answer to an `HttpProxy`.
    ProxyResponse(ProxyResponse),
    /// Agent → relay: externally observed agent address.
    Hello {
        /// Address as reported by the agent.
        ip: String,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum Typed {
    #[serde(rename = "http-proxy")]
    HttpProxy {
        #[serde(rename = "reqId")]
        req_id: String,
        req: ProxyRequest,
    },
    #[serde(rename = "HELLO")]
    Hello { ip: String },
    #[serde(rename = "close")]
    Close { id: StreamId },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Untyped {
    Response(ProxyResponse),
    Data(DataFrame),
}

impl ControlMessage {
    /// Parses one control-channel message.
    ///
    /// # Examples
    ///
    /// ```
    /// use wgt_common::ControlMessage;
    ///
    /// let msg = ControlMessage::parse(r#"{"type":"HELLO","ip":"203.0.113.7"}"#).unwrap();
    /// assert_eq!(msg, ControlMessage::Hello { ip: "203.0.113.7".into() });
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] for anything that is not one of
    /// the known envelope shapes, including objects with an unknown `type`.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            return Ok(match serde_json::from_value::<Typed>(value)? {
                Typed::HttpProxy { req_id, req } => Self::HttpProxy { req_id, req },
                Typed::Hello { ip } => Self::Hello { ip },
                Typed::Close { id } => Self::Close { id },
            });
        }
        Ok(match serde_json::from_value::<Untyped>(value)? {
            Untyped::Response(resp) => Self::ProxyResponse(resp),
            Untyped::Data(frame) => Self::Data(frame),
        })
    }

    /// Serializes the message to its wire JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Data(frame) => serde_json::to_value(frame),
            Self::ProxyResponse(resp) => serde_json::to_value(resp),
            Self::HttpProxy { req_id, req } => serde_json::to_value(Typed::HttpProxy {
                req_id: req_id.clone(),
                req: req.clone(),
            }),
            Self::Hello { ip } => serde_json::to_value(Typed::Hello { ip: ip.clone() }),
            Self::Close { id } => serde_json::to_value(Typed::Close { id: *id }),
        };
        // Every variant is plain strings, integers and maps with string keys.
        value.map(|v| v.to_string()).unwrap_or_default()
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Data(_) => "data",
            Self::Close { .. } => message_type::CLOSE,
            Self::HttpProxy { .. } => message_type::HTTP_PROXY,
            Self::ProxyResponse(_) => "proxy-response",
            Self::Hello { .. } => message_type::HELLO,
        }
    }
}

/// Flattens wire headers into `(name, value)` pairs, expanding arrays into
/// repeated headers and stringifying numbers and booleans.
#[must_use]
pub fn header_pairs(headers: &WireHeaders) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(headers.len());
    for (name, value) in headers {
        match value {
            Value::String(s) => pairs.push((name.clone(), s.clone())),
            Value::Array(items) => {
                for item in items {
                    if let Some(s) = scalar_to_string(item) {
                        pairs.push((name.clone(), s));
                    }
                }
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    pairs.push((name.clone(), s));
                }
            }
        }
    }
    pairs
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Adds a header to a wire map, turning repeated names into arrays.
pub fn push_header(headers: &mut WireHeaders, name: &str, value: &str) {
    let name = name.to_ascii_lowercase();
    match headers.get_mut(&name) {
        None => {
            headers.insert(name, Value::String(value.to_owned()));
        }
        Some(Value::Array(items)) => items.push(Value::String(value.to_owned())),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, Value::String(value.to_owned())]);
        }
    }
}

/// Base64-encodes a body, mapping empty bodies to `None`.
#[must_use]
pub fn encode_body(body: &[u8]) -> Option<String> {
    (!body.is_empty()).then(|| STANDARD.encode(body))
}

/// Decodes an optional base64 body; `None` decodes to an empty body.
///
/// # Errors
///
/// Returns [`EnvelopeError::Base64`] on invalid base64.
pub fn decode_body(body: Option<&str>) -> Result<Vec<u8>, EnvelopeError> {
    match body {
        Some(b) => Ok(STANDARD.decode(b)?),
        None => Ok(Vec::new()),
    }
}
