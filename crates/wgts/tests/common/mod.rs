#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use wgt_common::envelope::DataFrame;
use wgt_common::types::KEY_LEN;
use wgt_common::{ControlMessage, FrameCipher, StreamId};
use wgts::config::RelayConfig;
use wgts::Relay;

pub const TOKEN: &str = "wgt_integration_test_token_0123456789";
pub const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

pub fn test_config(listen: SocketAddr) -> RelayConfig {
    let mut config = RelayConfig::new(listen, TOKEN.to_string(), KEY);
    config.metrics_addr = "127.0.0.1:0".parse().unwrap();
    config.stream.flush_delay = Duration::from_millis(20);
    config.proxy_timeout = Duration::from_secs(5);
    config.http_idle_timeout = Duration::from_secs(2);
    config
}

pub async fn start_relay() -> (SocketAddr, Arc<Relay>) {
    start_relay_with(|_| {}).await
}

pub async fn start_relay_with(tweak: impl FnOnce(&mut RelayConfig)) -> (SocketAddr, Arc<Relay>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    tweak(&mut config);
    let relay = Arc::new(Relay::new(config));

    let relay_clone = relay.clone();
    tokio::spawn(async move {
        if let Err(e) = wgts::run(listener, relay_clone).await {
            eprintln!("relay error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, relay)
}

type AgentSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Minimal agent speaking the control-channel protocol.
pub struct FakeAgent {
    pub ws_tx: futures_util::stream::SplitSink<AgentSocket, Message>,
    pub ws_rx: futures_util::stream::SplitStream<AgentSocket>,
    pub cipher: FrameCipher,
}

impl FakeAgent {
    pub async fn try_connect(
        addr: &SocketAddr,
        token: Option<&str>,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}/tunnel");
        let mut req = url.into_client_request().unwrap();
        if let Some(token) = token {
            req.headers_mut()
                .insert("Authorization", format!("Bearer {token}").parse().unwrap());
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await?;
        let (ws_tx, ws_rx) = ws.split();
        Ok(Self {
            ws_tx,
            ws_rx,
            cipher: FrameCipher::new(&KEY),
        })
    }

    pub async fn connect(addr: &SocketAddr) -> Self {
        Self::try_connect(addr, Some(TOKEN)).await.unwrap()
    }

    pub async fn send(&mut self, msg: &ControlMessage) {
        self.send_text(&msg.to_json()).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_data(&mut self, id: StreamId, plaintext: &[u8]) {
        let frame = self.cipher.encrypt(plaintext).unwrap();
        self.send(&ControlMessage::Data(DataFrame::new(id, &frame)))
            .await;
    }

    pub async fn recv(&mut self) -> ControlMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for control message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return ControlMessage::parse(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text message, got {other:?}"),
            }
        }
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ControlMessage> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Next data frame, decrypted.
    pub async fn recv_data(&mut self) -> (StreamId, Vec<u8>) {
        match self.recv().await {
            ControlMessage::Data(frame) => {
                let plaintext = self.cipher.decrypt(&frame.frame().unwrap()).unwrap();
                (frame.id, plaintext)
            }
            other => panic!("expected data frame, got {other:?}"),
        }
    }

    /// Collects exactly `len` bytes for stream `id`, across frames.
    pub async fn recv_stream_bytes(&mut self, id: StreamId, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let (frame_id, bytes) = self.recv_data().await;
            assert_eq!(frame_id, id, "frame for unexpected stream");
            out.extend_from_slice(&bytes);
        }
        out
    }
}

/// Raw connection that is not HTTP, so the listener treats it as a stream.
pub async fn raw_client(addr: &SocketAddr, first: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(first).await.unwrap();
    stream
}

/// Reads until EOF, failing the test if the peer keeps the connection open.
pub async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("timeout waiting for EOF")
        .unwrap();
    out
}

pub struct HttpReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Sends one HTTP/1.1 request with `Connection: close` and parses the reply.
pub async fn http_request(addr: &SocketAddr, method: &str, path: &str, body: &[u8]) -> HttpReply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let head = format!(
        "{method} {path} HTTP/1.1\r\nHost: relay.test\r\nX-Test: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let raw = read_to_eof(&mut stream).await;
    parse_reply(&raw)
}

pub fn parse_reply(raw: &[u8]) -> HttpReply {
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in reply");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    HttpReply {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
