//! # beaconwatch-server
//!
//! HTTP server for the beaconwatch beacon monitoring service.
//!
//! This binary provides:
//! - REST API for packet ingestion, ranging, monitoring and layouts
//! - An optional internal scan cycle ticker
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package beaconwatch-server
//!
//! # With an explicit configuration file
//! BEACONWATCH_CONFIG=./beaconwatch.toml ./beaconwatch-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use beaconwatch_core::Config;
use beaconwatch_server::api;
use beaconwatch_server::logging;
use beaconwatch_server::state::AppState;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Names a configuration file that must exist.
const CONFIG_PATH_ENV: &str = "BEACONWATCH_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    logging::init(&config.server)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting beaconwatch-server");
    config.validate().context("Invalid configuration")?;

    let addr: SocketAddr = config
        .server
        .bind_address
        .parse()
        .context("Invalid bind address")?;
    let cycle_period_ms = config.server.cycle_period_ms;

    let state = AppState::new(config)?;
    let ticker = (cycle_period_ms > 0).then(|| spawn_cycle_ticker(state.clone(), cycle_period_ms));

    let app = api::create_router(state.clone());
    let listener = TcpListener::bind(addr).await?;

    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    state.pipeline().shutdown().await;
    info!("Shut down cleanly");

    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => {
            let path = PathBuf::from(path);
            Config::load_from(&path, true)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))
        }
        None => Config::load().context("Failed to load configuration"),
    }
}

/// Ends a scan cycle every `period_ms` for bridges that only post packets.
fn spawn_cycle_ticker(state: AppState, period_ms: u64) -> JoinHandle<()> {
    info!(period_ms, "Starting internal cycle ticker");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = state.pipeline().end_cycle().await {
                warn!(error = %e, "Cycle ticker stopped");
                break;
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
