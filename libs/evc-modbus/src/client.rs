//! Modbus TCP client
//!
//! Serialised request/response client with bounded retries and automatic
//! reconnection. All transactions go through `&mut self`, so at most one
//! request is in flight at any time.

use std::time::Instant;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::connection::{ConnectionParams, ModbusConnection};
use crate::error::{ModbusError, Result};
use crate::frame::{
    self, FrameBuilder, FC_READ_HOLDING, FC_WRITE_MULTIPLE, FC_WRITE_SINGLE,
};
use crate::retry::RetryPolicy;

/// Modbus TCP client for a single slave device
#[derive(Debug)]
pub struct ModbusTcpClient {
    params: ConnectionParams,
    policy: RetryPolicy,
    connection: Option<ModbusConnection>,
    frames: FrameBuilder,
}

impl ModbusTcpClient {
    pub fn new(params: ConnectionParams, policy: RetryPolicy) -> Self {
        Self {
            params,
            policy,
            connection: None,
            frames: FrameBuilder::new(),
        }
    }

    /// Check whether a connection is currently open
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Time of the last successful socket operation, if any
    pub fn last_io(&self) -> Option<Instant> {
        self.connection.as_ref().map(|c| c.last_io())
    }

    /// Open the TCP connection if it is not already open.
    ///
    /// Idempotent; called implicitly before every transaction, so the socket
    /// is opened on first use and reopened after any transport error.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.connection.is_none() {
            self.connection = Some(ModbusConnection::connect(&self.params).await?);
        }
        Ok(())
    }

    /// Close the connection; the next transaction reopens it
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("Connection closed: {}:{}", self.params.host, self.params.port);
        }
    }

    /// Read `count` holding registers (FC03)
    pub async fn read_holding(&mut self, slave_id: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        let pdu = frame::read_holding_pdu(address, count)?;
        let payload = self
            .transact_with_retry(slave_id, pdu, FC_READ_HOLDING, "read_holding")
            .await
            .map_err(|e| ModbusError::Read {
                address,
                count,
                slave_id,
                source: Box::new(e),
            })?;
        frame::parse_read_payload(&payload, count).map_err(|e| ModbusError::Read {
            address,
            count,
            slave_id,
            source: Box::new(e),
        })
    }

    /// Write a single register (FC06)
    pub async fn write_single(&mut self, slave_id: u8, address: u16, value: u16) -> Result<()> {
        let pdu = frame::write_single_pdu(address, value);
        self.transact_with_retry(slave_id, pdu, FC_WRITE_SINGLE, "write_single")
            .await
            .map_err(|e| ModbusError::Write {
                address,
                slave_id,
                source: Box::new(e),
            })?;
        Ok(())
    }

    /// Write multiple registers atomically (FC16).
    ///
    /// Required for any value spanning more than one register (32-bit and
    /// 64-bit quantities); the slave applies all registers or none.
    pub async fn write_multiple(&mut self, slave_id: u8, address: u16, values: &[u16]) -> Result<()> {
        let pdu = frame::write_multiple_pdu(address, values)?;
        self.transact_with_retry(slave_id, pdu, FC_WRITE_MULTIPLE, "write_multiple")
            .await
            .map_err(|e| ModbusError::Write {
                address,
                slave_id,
                source: Box::new(e),
            })?;
        Ok(())
    }

    /// Run one transaction with the retry policy applied.
    ///
    /// Transport errors close the connection, back off and retry; protocol
    /// errors fail immediately.
    async fn transact_with_retry(
        &mut self,
        slave_id: u8,
        pdu: Vec<u8>,
        expected_function: u8,
        operation: &str,
    ) -> Result<Vec<u8>> {
        let mut last_error = None;

        for attempt in 1..=self.policy.max_attempts {
            let backoff = self.policy.backoff_for(attempt);
            if !backoff.is_zero() {
                warn!(
                    "[RETRY] {} attempt {}/{}, delay {}ms",
                    operation,
                    attempt,
                    self.policy.max_attempts,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            match self.transact(slave_id, &pdu, expected_function).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transport() => {
                    self.close();
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(ModbusError::RetryExhausted {
            operation: operation.to_string(),
            attempts: self.policy.max_attempts,
            source: Box::new(last_error.unwrap_or(ModbusError::NotConnected)),
        })
    }

    /// Run a single request/response exchange
    async fn transact(&mut self, slave_id: u8, pdu: &[u8], expected_function: u8) -> Result<Vec<u8>> {
        self.ensure_connected().await?;
        let (transaction_id, request) = self.frames.frame(slave_id, pdu);

        let connection = self.connection.as_mut().ok_or(ModbusError::NotConnected)?;
        connection.send(&request).await?;
        let (header, response_pdu) = connection.recv().await?;

        if header.transaction_id != transaction_id {
            return Err(ModbusError::frame(format!(
                "Transaction id mismatch: sent {}, got {}",
                transaction_id, header.transaction_id
            )));
        }
        if header.unit_id != slave_id {
            return Err(ModbusError::frame(format!(
                "Unit id mismatch: sent {}, got {}",
                slave_id, header.unit_id
            )));
        }

        let payload = frame::parse_response_pdu(&response_pdu, expected_function)?;
        Ok(payload.to_vec())
    }
}

// ============================================================================
// Tests
// ============================================================================
