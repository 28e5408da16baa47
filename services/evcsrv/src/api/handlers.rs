//! API handlers
//!
//! Thin adapters between HTTP and the engine's command inbox; control
//! requests are equivalent to the corresponding bus writes and take effect
//! on the next tick.

use axum::extract::State;
use axum::Json;
use tracing::info;

use crate::api::dto::{
    ApiError, ConfigUpdated, HealthStatus, ModeRequest, SetCurrentRequest, StartStopRequest,
    SuccessResponse,
};
use crate::api::ApiState;
use crate::bus::ChartPoint;
use crate::config::DriverConfig;
use crate::control::ChargeMode;
use crate::engine::{Command, StatusReport};
use crate::error::DriverError;

/// Liveness probe
pub async fn health() -> Json<SuccessResponse<HealthStatus>> {
    Json(SuccessResponse::new(HealthStatus {
        status: "ok",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Latest engine snapshot
pub async fn get_status(State(state): State<ApiState>) -> Json<SuccessResponse<StatusReport>> {
    Json(SuccessResponse::new(state.engine.report()))
}

/// Select the charging mode
pub async fn set_mode(
    State(state): State<ApiState>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<SuccessResponse<u8>>, ApiError> {
    let mode = ChargeMode::from_code(request.mode)
        .ok_or_else(|| ApiError::bad_request(format!("invalid mode {}", request.mode)))?;

    state
        .engine
        .send(Command::SetMode(mode))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(SuccessResponse::new(request.mode)))
}

/// Enable or disable charging
pub async fn set_start_stop(
    State(state): State<ApiState>,
    Json(request): Json<StartStopRequest>,
) -> Result<Json<SuccessResponse<bool>>, ApiError> {
    state
        .engine
        .send(Command::SetStartStop(request.enabled))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(SuccessResponse::new(request.enabled)))
}

/// Set the intended charging current
pub async fn set_current(
    State(state): State<ApiState>,
    Json(request): Json<SetCurrentRequest>,
) -> Result<Json<SuccessResponse<f64>>, ApiError> {
    if !request.amps.is_finite() || request.amps < 0.0 {
        return Err(ApiError::bad_request(format!(
            "invalid current {}",
            request.amps
        )));
    }

    state
        .engine
        .send(Command::SetCurrent(request.amps))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(SuccessResponse::new(request.amps)))
}

/// The running configuration
pub async fn get_config(
    State(state): State<ApiState>,
) -> Json<SuccessResponse<DriverConfig>> {
    Json(SuccessResponse::new((*state.config).clone()))
}

/// Validate and persist a new configuration.
///
/// The running configuration stays unchanged for the rest of this run; the
/// document is written to the configuration file for the next start.
pub async fn put_config(
    State(state): State<ApiState>,
    Json(config): Json<DriverConfig>,
) -> Result<Json<SuccessResponse<ConfigUpdated<DriverConfig>>>, ApiError> {
    config.validate().map_err(|e| match e {
        DriverError::Config { field, reason } => ApiError::validation(field, reason),
        other => ApiError::internal(other.to_string()),
    })?;

    let rendered = serde_yaml::to_string(&config)
        .map_err(|e| ApiError::internal(format!("serialize failed: {e}")))?;
    write_atomically(&state.config_path, rendered.as_bytes())
        .map_err(|e| ApiError::internal(e.to_string()))?;

    info!(
        "Configuration updated via API, persisted to {}",
        state.config_path.display()
    );
    Ok(Json(SuccessResponse::new(ConfigUpdated {
        config,
        restart_required: true,
    })))
}

/// Recent chart points
pub async fn get_chart(
    State(state): State<ApiState>,
) -> Json<SuccessResponse<Vec<ChartPoint>>> {
    let points = state.chart.read().await.points();
    Json(SuccessResponse::new(points))
}

/// Temp-file-and-rename write, same discipline as the state store
fn write_atomically(path: &std::path::Path, payload: &[u8]) -> Result<(), DriverError> {
    use std::io::Write;

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| {
            DriverError::persistence(format!("cannot create {}: {e}", tmp_path.display()))
        })?;
        file.write_all(payload)
            .map_err(|e| DriverError::persistence(format!("write failed: {e}")))?;
        file.sync_all()
            .map_err(|e| DriverError::persistence(format!("sync failed: {e}")))?;
    }
    std::fs::rename(&tmp_path, path)
        .map_err(|e| DriverError::persistence(format!("rename failed: {e}")))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::api::{router, ApiState};
    use crate::control::SystemReadings;
    use crate::engine::Engine;
    use crate::port::fake::FakeCharger;

    async fn test_state(dir: &tempfile::TempDir) -> ApiState {
        let mut config = DriverConfig::default();
        config.modbus.host = "127.0.0.1".into();
        config.persistence.state_file = dir
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned();

        let (_, readings_rx) = watch::channel(SystemReadings::default());
        let (_engine, handle, chart) = Engine::new(
            config.clone(),
            FakeCharger::new(),
            Arc::new(crate::bus::LogBus),
            readings_rx,
            CancellationToken::new(),
        )
        .unwrap();

        ApiState {
            engine: handle,
            chart,
            config: Arc::new(config),
            config_path: dir.path().join("evcsrv.yaml"),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_endpoint_serves_latest_report() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status_code"], 0);
        assert_eq!(body["data"]["connected"], false);
    }

    #[tokio::test]
    async fn test_invalid_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir).await);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/mode")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"mode": 7}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_roundtrip_through_put_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir).await;
        let config_path = state.config_path.clone();
        let app = router(state);

        let mut updated = DriverConfig::default();
        updated.modbus.host = "192.168.7.7".into();
        updated.controls.max_set_current = 20.0;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&updated).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["restart_required"], true);

        // The persisted document parses back to the same configuration
        let reloaded = DriverConfig::load(&config_path).unwrap();
        assert_eq!(reloaded, updated);
    }

    #[tokio::test]
    async fn test_put_config_rejects_invalid_document() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir).await);

        // Missing host fails validation with a field path
        let invalid = DriverConfig::default();
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&invalid).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["field"], "modbus.host");
    }

    #[tokio::test]
    async fn test_chart_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(&dir).await);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/chart")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }
}
