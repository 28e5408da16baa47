//! Charger register port
//!
//! The seam between the control engine and the Modbus transport. The real
//! implementation is `evc_modbus::ModbusTcpClient`; tests drive the engine
//! against an in-memory register map.

use async_trait::async_trait;

use evc_modbus::{ModbusError, ModbusTcpClient};

/// Serialised access to the charger's holding registers
#[async_trait]
pub trait RegisterBus: Send {
    async fn read_holding(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;

    async fn write_single(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError>;

    async fn write_multiple(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError>;

    /// Drop the connection so the next operation reopens it
    fn disconnect(&mut self);
}

#[async_trait]
impl RegisterBus for ModbusTcpClient {
    async fn read_holding(
        &mut self,
        slave_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        ModbusTcpClient::read_holding(self, slave_id, address, count).await
    }

    async fn write_single(
        &mut self,
        slave_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        ModbusTcpClient::write_single(self, slave_id, address, value).await
    }

    async fn write_multiple(
        &mut self,
        slave_id: u8,
        address: u16,
        values: &[u16],
    ) -> Result<(), ModbusError> {
        ModbusTcpClient::write_multiple(self, slave_id, address, values).await
    }

    fn disconnect(&mut self) {
        self.close();
    }
}
