//! Connection management
//!
//! TCP connection handling with connect/operation timeouts and framed I/O.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::{ModbusError, Result};
use crate::frame::{MbapHeader, MBAP_HEADER_LEN};

/// Connection parameters for a Modbus TCP target
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    /// Timeout for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Timeout for each read/write on the socket
    pub op_timeout: Duration,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            op_timeout: Duration::from_secs(3),
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An open Modbus TCP connection
#[derive(Debug)]
pub struct ModbusConnection {
    stream: TcpStream,
    op_timeout: Duration,
    last_io: Instant,
}

impl ModbusConnection {
    /// Open a TCP connection to the target
    pub async fn connect(params: &ConnectionParams) -> Result<Self> {
        let addr = params.address();
        debug!("TCP connecting: {}", addr);

        match timeout(params.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                Ok(Self {
                    stream,
                    op_timeout: params.op_timeout,
                    last_io: Instant::now(),
                })
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                Err(ModbusError::connection(format!(
                    "Failed to connect to {addr}: {e}"
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(ModbusError::timeout(format!(
                    "Connection to {addr} timed out"
                )))
            },
        }
    }

    /// Time of the last successful socket operation
    pub fn last_io(&self) -> Instant {
        self.last_io
    }

    /// Send a complete frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        match timeout(self.op_timeout, self.stream.write_all(frame)).await {
            Ok(Ok(())) => {
                self.last_io = Instant::now();
                debug!("TCP TX: {}B", frame.len());
                Ok(())
            },
            Ok(Err(e)) => Err(ModbusError::Io(format!("TCP send error: {e}"))),
            Err(_) => Err(ModbusError::timeout("TCP send timed out")),
        }
    }

    /// Receive one complete frame (MBAP header + PDU)
    pub async fn recv(&mut self) -> Result<(MbapHeader, Vec<u8>)> {
        let mut header_buf = [0u8; MBAP_HEADER_LEN];
        match timeout(self.op_timeout, self.stream.read_exact(&mut header_buf)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(ModbusError::Io(format!("TCP recv error: {e}"))),
            Err(_) => return Err(ModbusError::timeout("TCP recv timed out")),
        }

        let header = MbapHeader::decode(&header_buf)?;

        // length counts the unit id, already consumed with the header
        let mut pdu = vec![0u8; header.length as usize - 1];
        match timeout(self.op_timeout, self.stream.read_exact(&mut pdu)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(ModbusError::Io(format!("TCP recv error: {e}"))),
            Err(_) => return Err(ModbusError::timeout("TCP recv timed out")),
        }

        self.last_io = Instant::now();
        debug!("TCP RX: {}B", MBAP_HEADER_LEN + pdu.len());
        Ok((header, pdu))
    }
}
