//! API request/response envelopes

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Success envelope
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Structured error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: StatusCode,
    pub success: bool,
    pub error: String,
    /// Field path for configuration/validation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            success: false,
            error: message.into(),
            field: None,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            success: false,
            error: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            success: false,
            error: message.into(),
            field: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// `POST /api/mode` body
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: u8,
}

/// `POST /api/startstop` body
#[derive(Debug, Deserialize)]
pub struct StartStopRequest {
    pub enabled: bool,
}

/// `POST /api/set_current` body
#[derive(Debug, Deserialize)]
pub struct SetCurrentRequest {
    pub amps: f64,
}

/// `GET /health` payload
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// `PUT /api/config` response payload
#[derive(Debug, Serialize)]
pub struct ConfigUpdated<T> {
    pub config: T,
    /// The running configuration is immutable; changes apply on restart
    pub restart_required: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_shape() {
        let body = serde_json::to_value(SuccessResponse::new(42)).unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["data"], 42);
    }

    #[test]
    fn test_error_skips_empty_field() {
        let body = serde_json::to_value(ApiError::bad_request("nope")).unwrap();
        assert_eq!(body["success"], false);
        assert!(body.get("field").is_none());

        let body = serde_json::to_value(ApiError::validation("modbus.host", "empty")).unwrap();
        assert_eq!(body["field"], "modbus.host");
    }
}
