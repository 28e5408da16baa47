//! Modbus TCP framing
//!
//! MBAP header handling, request PDU builders and response parsing for the
//! function codes the charger uses: 0x03 (read holding), 0x06 (write
//! single), 0x10 (write multiple).

use crate::error::{ModbusError, Result};

/// MBAP header length in bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size per the Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum registers per 0x03 read
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum registers per 0x10 write
pub const MAX_WRITE_REGISTERS: u16 = 123;

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_WRITE_SINGLE: u8 = 0x06;
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Modbus TCP MBAP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Length field (unit id + PDU)
    pub length: u16,
    /// Unit identifier (slave ID)
    pub unit_id: u8,
}

impl MbapHeader {
    /// Encode header to wire bytes
    pub fn encode(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut buf = [0u8; MBAP_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.length.to_be_bytes());
        buf[6] = self.unit_id;
        buf
    }

    /// Decode header from wire bytes
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::frame(format!(
                "MBAP header too short: {} bytes",
                buf.len()
            )));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([buf[0], buf[1]]),
            protocol_id: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]),
            unit_id: buf[6],
        };
        if header.protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "Unexpected protocol id: {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length as usize > 1 + MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "Implausible MBAP length: {}",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Builds complete Modbus TCP frames with a channel-local transaction counter
#[derive(Debug, Default)]
pub struct FrameBuilder {
    next_transaction_id: u16,
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            next_transaction_id: 1,
        }
    }

    /// Get next transaction ID - wraps naturally from 0xFFFF to 0x0000
    pub fn next_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Build a complete frame around a PDU; returns the transaction id used
    pub fn frame(&mut self, unit_id: u8, pdu: &[u8]) -> (u16, Vec<u8>) {
        let transaction_id = self.next_transaction_id();
        let header = MbapHeader {
            transaction_id,
            protocol_id: 0,
            length: (pdu.len() + 1) as u16,
            unit_id,
        };
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(pdu);
        (transaction_id, frame)
    }
}

/// Build request PDU for FC03 (Read Holding Registers)
pub fn read_holding_pdu(address: u16, count: u16) -> Result<Vec<u8>> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ModbusError::invalid_data(format!(
            "Invalid register count for FC03: {count}"
        )));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_READ_HOLDING);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

/// Build request PDU for FC06 (Write Single Register)
pub fn write_single_pdu(address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(FC_WRITE_SINGLE);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build request PDU for FC16 (Write Multiple Registers)
pub fn write_multiple_pdu(address: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
        return Err(ModbusError::invalid_data(format!(
            "Invalid register count for FC16: {}",
            values.len()
        )));
    }
    let mut pdu = Vec::with_capacity(6 + values.len() * 2);
    pdu.push(FC_WRITE_MULTIPLE);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push((values.len() * 2) as u8);
    for value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    Ok(pdu)
}

/// Validate a response PDU and strip the function code.
///
/// Detects exception responses (function code with the high bit set) and
/// function-code mismatches; returns the payload following the function code.
pub fn parse_response_pdu(pdu: &[u8], expected_function: u8) -> Result<&[u8]> {
    let Some(&function) = pdu.first() else {
        return Err(ModbusError::frame("Empty response PDU"));
    };

    if function == expected_function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ModbusError::Exception {
            function: expected_function,
            code,
        });
    }

    if function != expected_function {
        return Err(ModbusError::frame(format!(
            "Function code mismatch: expected {expected_function:#04X}, got {function:#04X}"
        )));
    }

    Ok(&pdu[1..])
}

/// Parse an FC03 response payload into register values
pub fn parse_read_payload(payload: &[u8], expected_count: u16) -> Result<Vec<u16>> {
    let Some(&byte_count) = payload.first() else {
        return Err(ModbusError::frame("FC03 response missing byte count"));
    };

    let data = &payload[1..];
    if byte_count as usize != data.len() || byte_count as usize != expected_count as usize * 2 {
        return Err(ModbusError::frame(format!(
            "FC03 byte count mismatch: declared {}, available {}, expected {}",
            byte_count,
            data.len(),
            expected_count * 2
        )));
    }

    let mut registers = Vec::with_capacity(expected_count as usize);
    for pair in data.chunks_exact(2) {
        registers.push(u16::from_be_bytes([pair[0], pair[1]]));
    }
    Ok(registers)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_roundtrip() {
        let header = MbapHeader {
            transaction_id: 0x1234,
            protocol_id: 0,
            length: 6,
            unit_id: 200,
        };
        let decoded = MbapHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_mbap_header_rejects_bad_protocol_id() {
        let mut bytes = MbapHeader {
            transaction_id: 1,
            protocol_id: 0,
            length: 6,
            unit_id: 1,
        }
        .encode();
        bytes[2] = 0xFF;
        assert!(MbapHeader::decode(&bytes).is_err());
    }

    #[test]
    fn test_build_fc03_read_request() {
        let pdu = read_holding_pdu(0x0132, 12).unwrap();
        assert_eq!(pdu, vec![0x03, 0x01, 0x32, 0x00, 0x0C]);
    }

    #[test]
    fn test_build_fc03_invalid_count() {
        assert!(read_holding_pdu(0, 0).is_err());
        assert!(read_holding_pdu(0, 126).is_err());
    }

    #[test]
    fn test_build_fc06_write_single() {
        let pdu = write_single_pdu(0x04BF, 0x0003);
        assert_eq!(pdu, vec![0x06, 0x04, 0xBF, 0x00, 0x03]);
    }

    #[test]
    fn test_build_fc16_write_multiple() {
        let pdu = write_multiple_pdu(0x04BA, &[0x4160, 0x0000]).unwrap();
        assert_eq!(
            pdu,
            vec![0x10, 0x04, 0xBA, 0x00, 0x02, 0x04, 0x41, 0x60, 0x00, 0x00]
        );
    }

    #[test]
    fn test_build_fc16_empty_values() {
        assert!(write_multiple_pdu(0x0100, &[]).is_err());
    }

    #[test]
    fn test_parse_response_exception() {
        let pdu = [0x83, 0x02];
        let err = parse_response_pdu(&pdu, 0x03).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception {
                function: 0x03,
                code: 0x02
            }
        ));
    }

    #[test]
    fn test_parse_response_function_mismatch() {
        let pdu = [0x04, 0x02, 0x00, 0x0A];
        assert!(parse_response_pdu(&pdu, 0x03).is_err());
    }

    #[test]
    fn test_parse_read_payload() {
        let payload = [0x04, 0x00, 0x0A, 0x01, 0x02];
        let registers = parse_read_payload(&payload, 2).unwrap();
        assert_eq!(registers, vec![0x000A, 0x0102]);
    }

    #[test]
    fn test_parse_read_payload_count_mismatch() {
        let payload = [0x04, 0x00, 0x0A];
        assert!(parse_read_payload(&payload, 2).is_err());
    }

    #[test]
    fn test_transaction_id_wraps() {
        let mut builder = FrameBuilder::new();
        builder.next_transaction_id = 0xFFFF;
        assert_eq!(builder.next_transaction_id(), 0xFFFF);
        assert_eq!(builder.next_transaction_id(), 0x0000);
        assert_eq!(builder.next_transaction_id(), 0x0001);
    }

    #[test]
    fn test_frame_layout() {
        let mut builder = FrameBuilder::new();
        let pdu = write_single_pdu(0x04BF, 3);
        let (tid, frame) = builder.frame(200, &pdu);
        assert_eq!(tid, 1);
        assert_eq!(frame.len(), MBAP_HEADER_LEN + pdu.len());
        let header = MbapHeader::decode(&frame).unwrap();
        assert_eq!(header.transaction_id, 1);
        assert_eq!(header.length as usize, pdu.len() + 1);
        assert_eq!(header.unit_id, 200);
        assert_eq!(&frame[MBAP_HEADER_LEN..], &pdu[..]);
    }
}
