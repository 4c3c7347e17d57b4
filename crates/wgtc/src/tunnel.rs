use crate::backoff::Backoff;
use crate::config::{AgentConfig, PublicIp, IP_DISCOVERY_URL};
use crate::error::AgentError;
use crate::local::{run_stream, STREAM_QUEUE};
use crate::proxy::LocalHttp;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use wgt_common::envelope::DataFrame;
use wgt_common::{ControlMessage, FrameCipher, StreamId};

/// Messages queued from stream and proxy tasks towards the relay.
const OUTBOUND_QUEUE: usize = 1024;

/// Closed stream ids remembered per session. Frames the relay sent before it
/// saw our `close` are dropped instead of dialling a second local connection.
const RECENTLY_CLOSED: usize = 1024;

/// The relay pings every 30 s; this much silence means the link is dead.
const RELAY_SILENCE_LIMIT: Duration = Duration::from_secs(90);

/// Connection status of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Not connected to the relay.
    Disconnected,
    /// Dial or upgrade in progress.
    Connecting,
    /// Upgrade accepted; streams are being served.
    Connected,
}

/// Top-level agent loop: keeps a control channel open, reconnecting with
/// backoff, until `shutdown` fires or the relay rejects the token.
///
/// # Errors
///
/// Returns the fatal error that stopped reconnecting.
pub async fn run_agent(
    config: Arc<AgentConfig>,
    status_tx: watch::Sender<ConnStatus>,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), AgentError> {
    let http = LocalHttp::new(&config.http_target, config.proxy_timeout)?;
    let mut backoff = Backoff::new(config.reconnect);

    loop {
        status_tx.send_replace(ConnStatus::Connecting);

        let result = tokio::select! {
            result = connect_and_run(&config, &http, &status_tx) => result,
            _ = shutdown.changed() => {
                status_tx.send_replace(ConnStatus::Disconnected);
                return Ok(());
            }
        };

        let was_connected = *status_tx.borrow() == ConnStatus::Connected;
        status_tx.send_replace(ConnStatus::Disconnected);
        match result {
            Ok(()) => info!("control channel closed"),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "fatal relay error, not retrying");
                return Err(e);
            }
            Err(e) => warn!(error = %e, "control channel lost"),
        }
        if was_connected {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting"
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Looks up the agent's public address. `None` on any failure.
pub async fn discover_public_ip(http: &reqwest::Client) -> Option<String> {
    let response = http
        .get(IP_DISCOVERY_URL)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .ok()?;
    let text = response.text().await.ok()?;
    let ip = text.trim();
    match ip.parse::<IpAddr>() {
        Ok(_) => Some(ip.to_string()),
        Err(_) => {
            debug!("public address lookup returned garbage");
            None
        }
    }
}

async fn hello_ip(config: &AgentConfig) -> Option<String> {
    match &config.public_ip {
        PublicIp::Disabled => None,
        PublicIp::Fixed(ip) => Some(ip.clone()),
        PublicIp::Discover => {
            let client = reqwest::Client::builder().build().ok()?;
            discover_public_ip(&client).await
        }
    }
}

/// Opens the control channel: bearer-authenticated WebSocket upgrade over
/// `ws://` or `wss://`.
async fn dial_relay(
    config: &AgentConfig,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, AgentError> {
    // Already installed after the first dial.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut req = config.relay_url.as_str().into_client_request()?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", config.tunnel_token))
        .map_err(|_| AgentError::InvalidToken)?;
    req.headers_mut().insert(AUTHORIZATION, bearer);
    let (ws, _) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(AgentError::from_handshake)?;
    Ok(ws)
}

async fn connect_and_run(
    config: &AgentConfig,
    http: &LocalHttp,
    status_tx: &watch::Sender<ConnStatus>,
) -> Result<(), AgentError> {
    let hello = hello_ip(config).await;
    let (mut ws_tx, mut ws_rx) = dial_relay(config).await?.split();

    status_tx.send_replace(ConnStatus::Connected);
    info!(relay = %config.relay_url, "control channel established");

    if let Some(ip) = hello {
        let msg = ControlMessage::Hello { ip };
        ws_tx.send(Message::Text(msg.to_json())).await?;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE);
    let mut session = Session::new(config, http, outbound_tx);

    let mut last_seen = tokio::time::Instant::now();
    let mut silence_check = tokio::time::interval(RELAY_SILENCE_LIMIT / 3);
    silence_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let msg = msg.ok_or(AgentError::Closed)??;
                last_seen = tokio::time::Instant::now();
                match msg {
                    Message::Text(text) => session.handle(&text),
                    Message::Binary(data) => match String::from_utf8(data) {
                        Ok(text) => session.handle(&text),
                        Err(_) => debug!("ignoring non-UTF-8 binary message"),
                    },
                    Message::Ping(data) => ws_tx.send(Message::Pong(data)).await?,
                    Message::Close(_) => return Ok(()),
                    _ => {}
                }
            }

            Some(msg) = outbound_rx.recv() => {
                session.sent(&msg);
                ws_tx.send(Message::Text(msg.to_json())).await?;
            }

            _ = silence_check.tick() => {
                if last_seen.elapsed() > RELAY_SILENCE_LIMIT {
                    warn!("relay silent for too long, dropping control channel");
                    return Err(AgentError::Closed);
                }
            }
        }
    }
}

/// Per-connection state: one entry per live stream.
struct Session<'a> {
    config: &'a AgentConfig,
    http: &'a LocalHttp,
    cipher: Arc<FrameCipher>,
    streams: HashMap<StreamId, mpsc::Sender<Vec<u8>>>,
    closed: VecDeque<StreamId>,
    outbound: mpsc::Sender<ControlMessage>,
}

impl<'a> Session<'a> {
    fn new(
        config: &'a AgentConfig,
        http: &'a LocalHttp,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            config,
            http,
            cipher: Arc::new(FrameCipher::new(&config.cipher_key)),
            streams: HashMap::new(),
            closed: VecDeque::with_capacity(RECENTLY_CLOSED),
            outbound,
        }
    }

    /// Bookkeeping for a message just written to the relay.
    fn sent(&mut self, msg: &ControlMessage) {
        if let ControlMessage::Close { id } = msg {
            self.forget(*id);
        }
    }

    fn handle(&mut self, text: &str) {
        let msg = match ControlMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "ignoring malformed control message");
                return;
            }
        };
        match msg {
            ControlMessage::Data(frame) => self.on_data(&frame),
            ControlMessage::Close { id } => {
                if self.streams.contains_key(&id) {
                    debug!(stream_id = id, "relay closed stream");
                }
                self.forget(id);
            }
            ControlMessage::HttpProxy { req_id, req } => {
                let http = self.http.clone();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    debug!(req_id = %req_id, method = %req.method, path = %req.path, "proxying request");
                    let resp = http.answer(req_id, req).await;
                    let _ = outbound.send(ControlMessage::ProxyResponse(resp)).await;
                });
            }
            other => debug!(kind = other.kind(), "ignoring relay-bound message"),
        }
    }

    fn on_data(&mut self, frame: &DataFrame) {
        let id = frame.id;
        if id == 0 {
            return;
        }
        if self.closed.contains(&id) {
            debug!(stream_id = id, "dropping frame for closed stream");
            return;
        }
        let plaintext = match frame
            .frame()
            .map_err(|e| e.to_string())
            .and_then(|f| self.cipher.decrypt(&f).map_err(|e| e.to_string()))
        {
            Ok(plaintext) => plaintext,
            Err(e) => {
                warn!(stream_id = id, error = %e, "undecryptable frame, closing stream");
                self.drop_stream(id);
                return;
            }
        };

        if let Some(tx) = self.streams.get(&id) {
            match tx.try_send(plaintext) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(stream_id = id, "local side not keeping up, closing stream");
                    self.drop_stream(id);
                }
                // The stream task already ended and queued its own `close`.
                Err(TrySendError::Closed(_)) => self.forget(id),
            }
            return;
        }

        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        if tx.try_send(plaintext).is_err() {
            return;
        }
        self.streams.insert(id, tx);
        debug!(stream_id = id, target = %self.config.target, "new stream");
        tokio::spawn(run_stream(
            id,
            self.config.target.clone(),
            self.config.dial,
            Arc::clone(&self.cipher),
            rx,
            self.outbound.clone(),
        ));
    }

    fn drop_stream(&mut self, id: StreamId) {
        self.forget(id);
        let _ = self.outbound.try_send(ControlMessage::Close { id });
    }

    fn forget(&mut self, id: StreamId) {
        self.streams.remove(&id);
        if self.closed.contains(&id) {
            return;
        }
        if self.closed.len() == RECENTLY_CLOSED {
            self.closed.pop_front();
        }
        self.closed.push_back(id);
    }
}
