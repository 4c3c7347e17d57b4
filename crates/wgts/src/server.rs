use crate::channel::ControlChannel;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::listener::demux;
use crate::metrics::{gauges, HealthState};
use crate::mux::StreamMux;
use crate::proxy::{text_response, PendingRequests};
use crate::ratelimit::RateLimiter;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use wgt_common::FrameCipher;

/// One relay instance: configuration plus every piece of shared state.
///
/// Nothing is process-global, so several relays can run side by side.
pub struct Relay {
    /// Runtime configuration.
    pub config: RelayConfig,
    /// Rate limiter consulted by the listener and the HTTP front-end.
    pub limiter: Arc<RateLimiter>,
    /// The single control-channel slot.
    pub channel: ControlChannel,
    /// Registry of forwarded raw connections.
    pub mux: Arc<StreamMux>,
    /// Proxied HTTP requests awaiting an agent response.
    pub pending: PendingRequests,
    /// Readiness reported on the metrics endpoint.
    pub health: HealthState,
    fallback_page: Option<Bytes>,
}

impl Relay {
    /// Builds the shared state for `config`.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let cipher = Arc::new(FrameCipher::new(&config.cipher_key));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit,
            config.whitelist.iter().copied(),
        ));
        let mux = Arc::new(StreamMux::new(config.stream, cipher));
        Self {
            config,
            limiter,
            channel: ControlChannel::new(),
            mux,
            pending: PendingRequests::new(),
            health: HealthState::new(),
            fallback_page: None,
        }
    }

    /// Uses `health` for readiness reporting instead of a private state.
    #[must_use]
    pub fn with_health(mut self, health: HealthState) -> Self {
        health.set_ready(self.channel.is_active());
        self.health = health;
        self
    }

    /// HTML served while no agent is attached.
    #[must_use]
    pub fn with_fallback_page(mut self, page: Bytes) -> Self {
        self.fallback_page = Some(page);
        self
    }

    /// `502` response for traffic that has no agent to go to.
    #[must_use]
    pub fn fallback_response(&self) -> Response<Full<Bytes>> {
        match &self.fallback_page {
            Some(page) => {
                let mut response = Response::new(Full::new(page.clone()));
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/html; charset=utf-8"),
                );
                response
            }
            None => text_response(StatusCode::BAD_GATEWAY, "No agent connected.\n"),
        }
    }

    /// Tears down everything tied to channel `generation`: every stream is
    /// closed, every pending proxy request fails and the reported address is
    /// forgotten. Stale generations are ignored.
    pub fn on_channel_closed(&self, generation: u64) {
        let mut streams = 0;
        let mut requests = 0;
        let detached = self.channel.detach(generation, || {
            streams = self.mux.close_all();
            requests = self.pending.cancel_all();
        });
        if !detached {
            return;
        }
        self.health.set_ready(false);
        gauges::set_channel_active(false);
        info!(generation, streams, requests, "control channel closed");
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, relay: Arc<Relay>) -> Result<(), RelayError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, relay, shutdown_rx).await
}

/// Run the relay accept loop with an externally-controlled shutdown signal.
///
/// When the sender behind `shutdown_rx` signals or is dropped, the accept loop
/// stops accepting new connections and waits for in-flight connections to
/// finish.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    relay: Arc<Relay>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), RelayError> {
    let local_addr = listener.local_addr().map_err(RelayError::Io)?;
    info!("relay listening on {}", local_addr);
    let sweeper = relay.limiter.spawn_sweeper();
    let task_tracker = Arc::new(tokio::sync::Notify::new());
    let mut active_tasks: usize = 0;

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let relay = Arc::clone(&relay);
                        let tracker = task_tracker.clone();
                        active_tasks += 1;
                        tokio::spawn(async move {
                            if let Err(e) = demux(relay, stream, addr).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                            tracker.notify_one();
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} connections", active_tasks);
                break;
            }
        }
    }

    sweeper.abort();

    // Wait for in-flight connections to finish (with timeout)
    let drain_timeout = std::time::Duration::from_secs(30);
    let deadline = tokio::time::Instant::now() + drain_timeout;
    while active_tasks > 0 {
        if tokio::time::timeout_at(deadline, task_tracker.notified())
            .await
            .is_err()
        {
            warn!(
                "drain timeout reached with {} connections still active",
                active_tasks
            );
            break;
        }
        active_tasks = active_tasks.saturating_sub(1);
    }

    info!("relay shut down gracefully");
    Ok(())
}
