#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wgtc::config::{AgentConfig, Args};
use wgtc::{run_agent, ConnStatus};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match AgentConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => anyhow::bail!("configuration error: {}", e),
    };
    info!(?config, "starting agent");

    let (status_tx, _status_rx) = watch::channel(ConnStatus::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let agent = tokio::spawn(run_agent(Arc::new(config), status_tx, shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received shutdown signal");
            let _ = shutdown_tx.send(());
        }
        finished = agent => match finished {
            Ok(result) => result?,
            Err(e) => anyhow::bail!("agent task failed: {}", e),
        },
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
        EnvFilter::new(format!("wgtc={level},wgt_common={level},warn"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
