#![forbid(unsafe_code)]

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wgts::config::{Args, RelayConfig};
use wgts::metrics::{start_metrics_server, HealthState};
use wgts::{run_with_shutdown, Relay};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match RelayConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => anyhow::bail!("configuration error: {}", e),
    };

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }
    info!(?config, "starting relay");

    let health_state = HealthState::new();
    let mut relay = Relay::new(config.clone()).with_health(health_state.clone());
    if let Some(path) = &config.fallback_page {
        let page = tokio::fs::read(path).await?;
        info!("serving fallback page from {}", path.display());
        relay = relay.with_fallback_page(Bytes::from(page));
    }
    let relay = Arc::new(relay);

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, relay, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(format!("wgts={level},wgt_common={level},warn"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
