//! # evc-modbus - Modbus TCP Client for EV Charging Stations
//!
//! A compact, async Modbus TCP client tailored to AC EV chargers that expose
//! a holding-register file (function codes 0x03, 0x06, 0x10) with big-endian
//! multi-register values.
//!
//! ## Architecture
//!
//! ```text
//! evc-modbus
//!     ├── ModbusTcpClient (serialised transactions, retry, reconnect)
//!     ├── ModbusConnection (TCP stream, timeouts, frame I/O)
//!     ├── frame (MBAP header, PDU builders, response parsing)
//!     ├── codec (big-endian register decode/encode helpers)
//!     └── RetryPolicy (bounded attempts, exponential backoff, jitter)
//! ```
//!
//! The client owns the socket and serialises all transactions through
//! `&mut self`; at most one request is in flight at any time. Transport
//! errors (socket closed, timeout, desynchronised stream) are retried with
//! the connection reopened between attempts; protocol errors (Modbus
//! exception responses, invalid payloads) fail immediately.

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod frame;
pub mod retry;

pub use client::ModbusTcpClient;
pub use codec::{
    decode_f32, decode_f64, decode_string, decode_u32, decode_u64, encode_f32,
};
pub use connection::{ConnectionParams, ModbusConnection};
pub use error::{ModbusError, Result};
pub use frame::{MbapHeader, MAX_PDU_SIZE, MBAP_HEADER_LEN};
pub use retry::RetryPolicy;
