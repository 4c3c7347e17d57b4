//! Relay and agent wired together over loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use wgt_common::types::KEY_LEN;
use wgtc::config::{AgentConfig, DialPolicy, PublicIp};
use wgtc::error::AgentError;
use wgtc::{run_agent, ConnStatus};
use wgts::config::RelayConfig;
use wgts::Relay;

const TOKEN: &str = "wgt_e2e_token_0123456789abcdef";
const KEY: [u8; KEY_LEN] = [0x17; KEY_LEN];

async fn start_relay() -> (SocketAddr, Arc<Relay>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = RelayConfig::new(addr, TOKEN.to_string(), KEY);
    config.stream.flush_delay = Duration::from_millis(20);
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

/// Local TCP service that echoes every connection.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = conn.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Local HTTP service answering every request with `hello`.
async fn start_http() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = conn
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Local: e2e\r\nConnection: close\r\n\r\nhello",
                    )
                    .await;
                let _ = conn.shutdown().await;
            });
        }
    });
    addr
}

fn agent_config(relay: SocketAddr, target: SocketAddr) -> AgentConfig {
    let mut config = AgentConfig::new(
        format!("ws://{relay}/tunnel"),
        TOKEN.to_string(),
        KEY,
        target.to_string(),
    );
    config.dial = DialPolicy {
        retry_delay: Duration::from_millis(50),
        max_attempts: 3,
    };
    config
}

struct RunningAgent {
    status: watch::Receiver<ConnStatus>,
    shutdown: watch::Sender<()>,
    handle: tokio::task::JoinHandle<Result<(), AgentError>>,
}

fn spawn_agent(config: AgentConfig) -> RunningAgent {
    let (status_tx, status) = watch::channel(ConnStatus::Disconnected);
    let (shutdown, shutdown_rx) = watch::channel(());
    let handle = tokio::spawn(run_agent(Arc::new(config), status_tx, shutdown_rx));
    RunningAgent {
        status,
        shutdown,
        handle,
    }
}

async fn wait_connected(agent: &mut RunningAgent) {
    tokio::time::timeout(
        Duration::from_secs(5),
        agent.status.wait_for(|s| *s == ConnStatus::Connected),
    )
    .await
    .expect("agent did not connect")
    .unwrap();
}

#[tokio::test]
async fn raw_tcp_reaches_local_service() {
    let (relay_addr, relay) = start_relay().await;
    let echo = start_echo().await;
    let mut agent = spawn_agent(agent_config(relay_addr, echo));
    wait_connected(&mut agent).await;
    assert!(relay.channel.is_active());

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"\x00ping").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"\x00ping");

    client.write_all(b"second chunk").await.unwrap();
    let mut buf = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"second chunk");
}

#[tokio::test]
async fn http_reaches_local_service() {
    let (relay_addr, _relay) = start_relay().await;
    let local = start_http().await;
    let mut config = agent_config(relay_addr, local);
    config.http_target = format!("http://{local}");
    let mut agent = spawn_agent(config);
    wait_connected(&mut agent).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: public.example\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let reply = String::from_utf8(reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
    assert!(reply.to_ascii_lowercase().contains("x-local: e2e"));
    assert!(reply.ends_with("hello"));
}

#[tokio::test]
async fn unreachable_local_service_closes_client() {
    let (relay_addr, relay) = start_relay().await;
    let gone = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = gone.local_addr().unwrap();
    drop(gone);

    let mut agent = spawn_agent(agent_config(relay_addr, target));
    wait_connected(&mut agent).await;

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"\x00anyone?").await.unwrap();
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert!(relay.mux.is_empty());
}

#[tokio::test]
async fn hello_reports_public_address() {
    let (relay_addr, relay) = start_relay().await;
    let echo = start_echo().await;
    let mut config = agent_config(relay_addr, echo);
    config.public_ip = PublicIp::Fixed("192.0.2.44".into());
    let mut agent = spawn_agent(config);
    wait_connected(&mut agent).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.channel.exposed_ip().is_none() {
        assert!(tokio::time::Instant::now() < deadline, "HELLO not recorded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(relay.channel.exposed_ip().as_deref(), Some("192.0.2.44"));
}

#[tokio::test]
async fn wrong_token_stops_agent() {
    let (relay_addr, relay) = start_relay().await;
    let echo = start_echo().await;
    let mut config = agent_config(relay_addr, echo);
    config.tunnel_token = "wgt_definitely_not_the_token".into();
    let agent = spawn_agent(config);

    let result = tokio::time::timeout(Duration::from_secs(5), agent.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AgentError::Unauthorized)));
    assert!(!relay.channel.is_active());
}

#[tokio::test]
async fn shutdown_stops_agent_and_frees_channel() {
    let (relay_addr, relay) = start_relay().await;
    let echo = start_echo().await;
    let mut agent = spawn_agent(agent_config(relay_addr, echo));
    wait_connected(&mut agent).await;

    agent.shutdown.send(()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), agent.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while relay.channel.is_active() {
        assert!(tokio::time::Instant::now() < deadline, "channel still active");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
