//! Local management API
//!
//! Serves the web dashboard: live status, mode/start-stop/current controls
//! mirroring the bus writes, configuration round-trip and the chart ring.
//! LAN-local and unauthenticated by design.

pub mod dto;
pub mod handlers;

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::RwLock;

use crate::bus::ChartRing;
use crate::config::DriverConfig;
use crate::engine::EngineHandle;

/// Shared state for the API handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    pub chart: Arc<RwLock<ChartRing>>,
    /// The immutable running configuration
    pub config: Arc<DriverConfig>,
    /// Where `PUT /api/config` persists the next run's configuration
    pub config_path: PathBuf,
}

/// Build the API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/status", get(handlers::get_status))
        .route("/api/mode", post(handlers::set_mode))
        .route("/api/startstop", post(handlers::set_start_stop))
        .route("/api/set_current", post(handlers::set_current))
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::put_config),
        )
        .route("/api/chart", get(handlers::get_chart))
        .with_state(state)
}
