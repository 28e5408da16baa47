//! # EV Charger Control Service - Main Entry Point
//!
//! Loads the configuration, connects the control engine to the charger and
//! starts the management API, then runs until SIGINT/SIGTERM.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Config (YAML) │───►│  Control Engine │◄──►│  Alfen wallbox  │
//! └─────────────────┘    │  (owner task)   │    │  (Modbus TCP)   │
//!                        └────────┬────────┘    └─────────────────┘
//!                                 │
//!                   ┌─────────────┴─────────────┐
//!                   ▼                           ▼
//!          ┌─────────────────┐         ┌─────────────────┐
//!          │  System bus     │         │  API (axum)     │
//!          │  publication    │         │  /api/status …  │
//!          └─────────────────┘         └─────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use evc_modbus::{ConnectionParams, ModbusTcpClient, RetryPolicy};

use evcsrv::api::{self, ApiState};
use evcsrv::bus::LogBus;
use evcsrv::config::DriverConfig;
use evcsrv::control::SystemReadings;
use evcsrv::engine::Engine;
use evcsrv::wait_for_shutdown;

/// Command line arguments for the EV charger control service
#[derive(Parser)]
#[command(
    name = "evcsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "EV charger control service",
    long_about = "Control daemon bridging an Alfen NG9xx wallbox onto a Victron GX system bus"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/evcsrv.yaml")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Configuration errors at startup are fatal
    let config = match DriverConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration {}: {e}", args.config.display());
            std::process::exit(1);
        },
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .init();

    info!(
        "Starting EV charger control service v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "Charger at {}:{} (socket slave {}, station slave {})",
        config.modbus.host,
        config.modbus.port,
        config.modbus.socket_slave_id,
        config.modbus.station_slave_id
    );

    let mut params = ConnectionParams::new(config.modbus.host.clone(), config.modbus.port);
    params.connect_timeout = Duration::from_secs(config.modbus.connect_timeout_secs);
    params.op_timeout = Duration::from_secs(config.modbus.op_timeout_secs);
    let client = ModbusTcpClient::new(params, RetryPolicy::default());

    // The system-bus binding feeds AUTO-mode inputs through this channel;
    // without one attached the driver sees zero PV and an unknown SOC
    let (_readings_tx, readings_rx) = watch::channel(SystemReadings::default());

    let shutdown = CancellationToken::new();
    let (engine, handle, chart) = Engine::new(
        config.clone(),
        client,
        Arc::new(LogBus),
        readings_rx,
        shutdown.clone(),
    )
    .context("engine setup failed")?;

    let engine_task = tokio::spawn(engine.run());

    // API server; failure to bind is fatal
    let api_task = if config.api.enabled {
        let bind_address: SocketAddr = config
            .api
            .bind_address
            .parse()
            .context("invalid api.bind_address")?;
        let state = ApiState {
            engine: handle.clone(),
            chart,
            config: Arc::new(config.clone()),
            config_path: args.config.clone(),
        };
        let app = api::router(state).layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_headers([axum::http::header::CONTENT_TYPE])
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                ]),
        );

        let listener = tokio::net::TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("cannot bind API at {bind_address}"))?;
        info!("Management API listening on http://{bind_address}");

        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("API server failed: {e}");
            }
        }))
    } else {
        info!("Management API disabled in configuration");
        None
    };

    info!("Service startup completed");
    wait_for_shutdown().await;
    info!("Received shutdown signal, starting graceful shutdown");

    shutdown.cancel();
    match tokio::time::timeout(Duration::from_secs(5), engine_task).await {
        Ok(Ok(Ok(()))) => info!("Engine shut down gracefully"),
        Ok(Ok(Err(e))) => error!("Engine failed: {e}"),
        Ok(Err(e)) => error!("Engine task panicked: {e}"),
        Err(_) => warn!("Engine shutdown timed out"),
    }

    if let Some(api_task) = api_task {
        api_task.abort();
        let _ = api_task.await;
    }

    info!("Service shutdown complete");
    Ok(())
}
