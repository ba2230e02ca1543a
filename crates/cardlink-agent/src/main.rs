//! `Cardlink` Agent
//!
//! Pairs with the cloud, polls for card issuance jobs, encodes cards on the
//! attached reader, and parks failed work in a durable queue for replay.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use cardlink_agent::agent::Agent;
use cardlink_agent::control::build_router;
use cardlink_core::config::{CardDriverKind, load_config};

#[derive(Parser, Debug)]
#[command(name = "cardlink-agent")]
#[command(version, about = "Cardlink agent - offline-tolerant access-card issuance")]
struct Args {
    /// Config file (replaces the global settings.json)
    #[arg(long, env = "CARDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Cloud API base URL
    #[arg(long, env = "CARDLINK_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Directory holding identity.json and queue.db
    #[arg(long, env = "CARDLINK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Card driver: auto, pcsc, or simulated
    #[arg(long, env = "CARDLINK_CARD_DRIVER")]
    card_driver: Option<CardDriverKind>,

    /// Control API bind address
    #[arg(long, env = "CARDLINK_CONTROL_ADDR")]
    control_addr: Option<SocketAddr>,

    /// Disable the loopback control API
    #[arg(long)]
    no_control: bool,

    /// Log level filter for the agent (e.g. "info", "debug", "warn").
    #[arg(long, env = "CARDLINK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CARDLINK_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "CARDLINK_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(url) = args.cloud_url {
        config.cloud.base_url = url;
    }
    if let Some(dir) = args.data_dir {
        config.agent.data_dir = Some(dir);
    }
    if let Some(driver) = args.card_driver {
        config.card.driver = driver;
    }
    if let Some(addr) = args.control_addr {
        config.control.addr = addr;
    }
    if args.no_control {
        config.control.enabled = false;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!("cardlink_agent={}", config.log_level);
    let tracing_guard = cardlink_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cloud = %config.cloud.base_url,
        driver = config.card.driver.as_str(),
        "Starting cardlink-agent"
    );

    let agent = Agent::start(&config).await?;

    let listener = if config.control.enabled {
        Some(tokio::net::TcpListener::bind(config.control.addr).await?)
    } else {
        None
    };
    let control_server = async {
        match listener {
            Some(listener) => {
                info!(addr = %config.control.addr, "Control API ready");
                axum::serve(listener, build_router(agent.control())).await
            }
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the agent is ready (unix only).
    #[cfg(unix)]
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to notify systemd");
    }

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = control_server => {
            if let Err(e) = result {
                warn!(error = %e, "Control API stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    agent.shutdown().await;
    tracing_guard.shutdown();
    Ok(())
}
