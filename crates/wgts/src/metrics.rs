use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state; ready while an agent is attached.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state, initially not ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready or not.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the metrics HTTP
/// server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 while a control channel is active,
/// 503 otherwise.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "no agent",
                ready: false,
            }),
        )
    }
}

/// Stream and channel gauges.
pub mod gauges {
    /// Set the number of registered streams.
    pub fn set_streams_active(count: usize) {
        metrics::gauge!("wgt_streams_active").set(count as f64);
    }

    /// Set whether a control channel is attached.
    pub fn set_channel_active(active: bool) {
        metrics::gauge!("wgt_channel_active").set(if active { 1.0 } else { 0.0 });
    }
}

/// Event counters.
pub mod counters {
    /// Record an accepted public connection with the route it took.
    pub fn connections_total(route: &'static str) {
        metrics::counter!("wgt_connections_total", "route" => route).increment(1);
    }

    /// Record a control-channel upgrade attempt with its outcome.
    pub fn channel_attach_total(outcome: &'static str) {
        metrics::counter!("wgt_channel_attach_total", "outcome" => outcome).increment(1);
    }

    /// Increment the opened-streams counter.
    pub fn streams_opened_total() {
        metrics::counter!("wgt_streams_opened_total").increment(1);
    }

    /// Record a stream teardown with its reason.
    pub fn streams_closed_total(reason: &'static str) {
        metrics::counter!("wgt_streams_closed_total", "reason" => reason).increment(1);
    }

    /// Record one data frame in the given direction.
    pub fn frames_total(direction: &'static str) {
        metrics::counter!("wgt_frames_total", "direction" => direction).increment(1);
    }

    /// Record a dropped frame with its reason.
    pub fn frames_dropped_total(reason: &'static str) {
        metrics::counter!("wgt_frames_dropped_total", "reason" => reason).increment(1);
    }

    /// Record plaintext bytes relayed in the given direction.
    pub fn payload_bytes_total(direction: &'static str, bytes: u64) {
        metrics::counter!("wgt_payload_bytes_total", "direction" => direction).increment(bytes);
    }

    /// Increment the frame authentication failure counter.
    pub fn auth_failures_total() {
        metrics::counter!("wgt_frame_auth_failures_total").increment(1);
    }

    /// Record a rate-limit rejection with its reason.
    pub fn rate_limited_total(reason: &'static str) {
        metrics::counter!("wgt_rate_limited_total", "reason" => reason).increment(1);
    }

    /// Increment the global-ban trigger counter.
    pub fn global_bans_total() {
        metrics::counter!("wgt_global_bans_total").increment(1);
    }

    /// Record a proxied HTTP request with its outcome.
    pub fn proxy_requests_total(outcome: &'static str) {
        metrics::counter!("wgt_proxy_requests_total", "outcome" => outcome).increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record a proxied request round trip in seconds.
    pub fn proxy_latency_seconds(value: f64) {
        metrics::histogram!("wgt_proxy_latency_seconds").record(value);
    }
}
