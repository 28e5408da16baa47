//! Modbus Error Types
//!
//! Core error types for the Modbus TCP client.

use thiserror::Error;

/// Result type for evc-modbus operations
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Modbus client errors
#[derive(Debug, Error, Clone)]
pub enum ModbusError {
    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Frame-level errors (bad header, transaction mismatch, truncated PDU)
    #[error("Frame error: {0}")]
    Frame(String),

    /// Modbus exception response from the slave
    #[error("Modbus exception: function {function:#04X}, code {code:#04X} ({name})", name = exception_name(.code))]
    Exception { function: u8, code: u8 },

    /// Invalid data (decode failures, out-of-range requests)
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Read context wrapper
    #[error("Read failed: address {address}, count {count}, slave {slave_id}: {source}")]
    Read {
        address: u16,
        count: u16,
        slave_id: u8,
        #[source]
        source: Box<ModbusError>,
    },

    /// Write context wrapper
    #[error("Write failed: address {address}, slave {slave_id}: {source}")]
    Write {
        address: u16,
        slave_id: u8,
        #[source]
        source: Box<ModbusError>,
    },

    /// Retry budget exhausted
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<ModbusError>,
    },
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Io(err.to_string())
    }
}

/// Human-readable name for a Modbus exception code
fn exception_name(code: &u8) -> &'static str {
    match *code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn connection(msg: impl Into<String>) -> Self {
        ModbusError::Connection(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        ModbusError::Timeout(msg.into())
    }

    pub fn frame(msg: impl Into<String>) -> Self {
        ModbusError::Frame(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> Self {
        ModbusError::InvalidData(msg.into())
    }

    /// Check if this error is a transport failure.
    ///
    /// Transport failures are retried with the connection reopened between
    /// attempts. Everything else (exception responses, invalid payloads) is a
    /// protocol error and fails immediately.
    pub fn is_transport(&self) -> bool {
        match self {
            ModbusError::Connection(_)
            | ModbusError::NotConnected
            | ModbusError::Io(_)
            | ModbusError::Timeout(_)
            | ModbusError::Frame(_) => true,
            ModbusError::Read { source, .. }
            | ModbusError::Write { source, .. }
            | ModbusError::RetryExhausted { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}
