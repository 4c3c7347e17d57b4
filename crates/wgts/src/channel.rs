//! Control channel manager.
//!
//! At most one agent is attached at a time. The channel is `Idle` or
//! `Active(generation)`; every attach draws a new generation so a late
//! teardown from a previous channel can never detach its successor.
//!
//! | state          | event            | next           | effect                    |
//! |----------------|------------------|----------------|---------------------------|
//! | `Idle`         | attach           | `Active(g)`    | outbound queue created    |
//! | `Active(g)`    | attach           | `Active(g)`    | request refused           |
//! | `Active(g)`    | detach(g)        | `Idle`         | streams and proxies torn down |
//! | `Active(g)`    | detach(other)    | `Active(g)`    | none                      |

use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::proxy::text_response;
use crate::server::Relay;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, AUTHORIZATION, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
    WWW_AUTHENTICATE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use wgt_common::ControlMessage;

/// Messages queued towards the agent before stream tasks start waiting.
const OUTBOUND_QUEUE: usize = 1024;

/// Largest control message accepted from the agent (proxied bodies are
/// base64 inside JSON).
const MAX_CONTROL_MESSAGE: usize = 32 * 1024 * 1024;

#[derive(Debug)]
struct ActiveChannel {
    generation: u64,
    tx: mpsc::Sender<ControlMessage>,
    peer: IpAddr,
    attached_at: Instant,
    exposed_ip: Option<String>,
}

#[derive(Debug)]
enum ChannelState {
    Idle,
    Active(ActiveChannel),
}

/// The single control-channel slot.
#[derive(Debug)]
pub struct ControlChannel {
    state: Mutex<ChannelState>,
    next_generation: AtomicU64,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    /// Creates an idle slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState::Idle),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the slot for an agent at `peer`.
    ///
    /// Returns the channel generation and the receiver of messages destined
    /// for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ChannelBusy`] while another channel is active;
    /// the active channel is left untouched.
    pub fn try_attach(
        &self,
        peer: IpAddr,
    ) -> Result<(u64, mpsc::Receiver<ControlMessage>), RelayError> {
        let mut state = self.lock();
        if matches!(*state, ChannelState::Active(_)) {
            return Err(RelayError::ChannelBusy);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        *state = ChannelState::Active(ActiveChannel {
            generation,
            tx,
            peer,
            attached_at: Instant::now(),
            exposed_ip: None,
        });
        Ok((generation, rx))
    }

    /// Returns the slot to `Idle` if `generation` is still the active one.
    ///
    /// `on_detach` runs before the slot can be claimed again, so its cascade
    /// only ever sees the departing channel's streams.
    pub fn detach(&self, generation: u64, on_detach: impl FnOnce()) -> bool {
        let mut state = self.lock();
        match &*state {
            ChannelState::Active(active) if active.generation == generation => {
                tracing::debug!(
                    generation,
                    uptime_secs = active.attached_at.elapsed().as_secs(),
                    "detaching control channel"
                );
                on_detach();
                *state = ChannelState::Idle;
                true
            }
            _ => false,
        }
    }

    /// Sender for messages to the active agent, if any.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<ControlMessage>> {
        match &*self.lock() {
            ChannelState::Active(active) => Some(active.tx.clone()),
            ChannelState::Idle => None,
        }
    }

    /// Returns `true` while an agent is attached.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), ChannelState::Active(_))
    }

    /// Address the active agent connected from.
    #[must_use]
    pub fn peer(&self) -> Option<IpAddr> {
        match &*self.lock() {
            ChannelState::Active(active) => Some(active.peer),
            ChannelState::Idle => None,
        }
    }

    /// Records the agent's self-reported external address. Only the first
    /// report per channel is kept.
    pub fn record_hello(&self, generation: u64, ip: &str) -> bool {
        match &mut *self.lock() {
            ChannelState::Active(active)
                if active.generation == generation && active.exposed_ip.is_none() =>
            {
                active.exposed_ip = Some(ip.to_owned());
                true
            }
            _ => false,
        }
    }

    /// The agent's reported external address, cleared when it detaches.
    #[must_use]
    pub fn exposed_ip(&self) -> Option<String> {
        match &*self.lock() {
            ChannelState::Active(active) => active.exposed_ip.clone(),
            ChannelState::Idle => None,
        }
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header.
#[must_use]
pub fn bearer_token(value: Option<&HeaderValue>) -> Option<&str> {
    let (scheme, token) = value?.to_str().ok()?.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Compares tokens without short-circuiting on the first differing byte.
#[must_use]
pub fn token_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Returns `true` for WebSocket upgrade requests.
#[must_use]
pub fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Handles an upgrade request to the tunnel path.
///
/// # Errors
///
/// Returns [`RelayError::ChannelBusy`] when an agent is already attached;
/// the caller drops the connection without a response.
pub async fn accept_upgrade(
    relay: Arc<Relay>,
    mut req: Request<Incoming>,
    source: IpAddr,
) -> Result<Response<Full<Bytes>>, RelayError> {
    let authorized = bearer_token(req.headers().get(AUTHORIZATION))
        .is_some_and(|token| token_matches(token, &relay.config.tunnel_token));
    if !authorized {
        counters::channel_attach_total("unauthorized");
        tracing::warn!(ip = %source, "control channel rejected: bad or missing token");
        let mut response = text_response(StatusCode::UNAUTHORIZED, "Unauthorized\n");
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        return Ok(response);
    }

    let Some(accept_key) = req
        .headers()
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
    else {
        counters::channel_attach_total("bad_request");
        return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request\n"));
    };

    let (generation, outbound_rx) = match relay.channel.try_attach(source) {
        Ok(attached) => attached,
        Err(e) => {
            counters::channel_attach_total("busy");
            tracing::warn!(ip = %source, "control channel rejected: already active");
            return Err(e);
        }
    };

    relay.limiter.whitelist(source);
    relay.health.set_ready(true);
    gauges::set_channel_active(true);
    counters::channel_attach_total("accepted");
    tracing::info!(ip = %source, generation, "control channel attached");

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let config = WebSocketConfig {
                    max_message_size: Some(MAX_CONTROL_MESSAGE),
                    max_frame_size: Some(MAX_CONTROL_MESSAGE),
                    ..WebSocketConfig::default()
                };
                let ws = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    Some(config),
                )
                .await;
                if let Err(e) = run_channel(&relay, ws, generation, outbound_rx).await {
                    tracing::debug!(generation, error = %e, "control channel ended with error");
                }
            }
            Err(e) => tracing::warn!(generation, error = %e, "control channel upgrade failed"),
        }
        relay.on_channel_closed(generation);
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    Ok(response)
}

/// Drives the control channel until the agent disconnects or goes idle.
///
/// # Errors
///
/// Returns the transport error that ended the channel, if any.
pub async fn run_channel<S>(
    relay: &Relay,
    ws: WebSocketStream<S>,
    generation: u64,
    mut outbound_rx: mpsc::Receiver<ControlMessage>,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let Some(outbound) = relay.channel.sender() else {
        return Err(RelayError::ChannelClosed);
    };
    let mut ping_interval = interval(relay.config.ping_interval);
    let idle_timeout = relay.config.channel_idle_timeout;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(relay, generation, &text, &outbound),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => dispatch(relay, generation, text, &outbound),
                        Err(_) => counters::frames_dropped_total("malformed"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_tx.send(Message::Pong(data)).await {
                            tracing::debug!("failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    _ => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                ws_tx.send(Message::Text(msg.to_json())).await?;
            }
            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    tracing::info!(generation, "control channel idle, closing");
                    return Ok(());
                }
                if let Err(e) = ws_tx.send(Message::Ping(vec![])).await {
                    tracing::debug!("failed to send ping: {}", e);
                }
            }
        }
    }
}

/// Routes one agent message. Malformed messages are ignored.
fn dispatch(
    relay: &Relay,
    generation: u64,
    text: &str,
    outbound: &mpsc::Sender<ControlMessage>,
) {
    let msg = match ControlMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring malformed control message");
            counters::frames_dropped_total("malformed");
            return;
        }
    };

    match msg {
        ControlMessage::Data(frame) => {
            if relay.mux.on_remote_frame(&frame).is_err() {
                let _ = outbound.try_send(ControlMessage::Close { id: frame.id });
            }
        }
        ControlMessage::Close { id } => {
            if relay.mux.close_stream(id) {
                tracing::debug!(stream_id = id, "agent closed stream");
            }
        }
        ControlMessage::ProxyResponse(resp) => {
            let req_id = resp.req_id.clone();
            if !relay.pending.respond(resp) {
                tracing::debug!(req_id = %req_id, "no pending request for response");
            }
        }
        ControlMessage::Hello { ip } => {
            if relay.channel.record_hello(generation, &ip) {
                tracing::info!(exposed_ip = %ip, "agent reported external address");
            }
        }
        other @ ControlMessage::HttpProxy { .. } => {
            tracing::debug!(kind = other.kind(), "ignoring relay-bound message from agent");
        }
    }
}
