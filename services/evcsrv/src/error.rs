//! Service error types

use evc_modbus::ModbusError;
use thiserror::Error;

/// Result type for evcsrv operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Control-service errors
#[derive(Debug, Error)]
pub enum DriverError {
    /// Configuration errors, carrying the offending field path
    #[error("Configuration error at {field}: {reason}")]
    Config { field: String, reason: String },

    /// Modbus transport/protocol errors
    #[error(transparent)]
    Modbus(#[from] ModbusError),

    /// Write verification failed: read-back disagrees with the written value
    #[error("Verification failed: register {register}, wrote {written:.2}, read back {read_back:.2}")]
    Verification {
        register: u16,
        written: f64,
        read_back: f64,
    },

    /// State-file persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Price feed errors
    #[error("Price feed error: {0}")]
    PriceFeed(String),

    /// Inconsistent policy output (coerced, logged; never fatal)
    #[error("Policy error: {0}")]
    Policy(String),

    /// Engine shut down before the request could be handled
    #[error("Engine unavailable")]
    EngineGone,
}

impl DriverError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::Config {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        DriverError::Persistence(msg.into())
    }

    /// Check if the underlying failure is a recoverable transport error
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Modbus(e) if e.is_transport())
    }
}
