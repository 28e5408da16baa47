//! Register codec
//!
//! Pure decoding and encoding helpers for big-endian multi-register values.
//! The charger transmits all multi-byte quantities in network byte order
//! (most significant register first, most significant byte first).

use crate::error::{ModbusError, Result};

/// Decode a 32-bit IEEE-754 float from two consecutive registers
pub fn decode_f32(registers: &[u16]) -> Result<f32> {
    let bytes = register_bytes::<4>(registers, "float32")?;
    Ok(f32::from_be_bytes(bytes))
}

/// Decode a 64-bit IEEE-754 float from four consecutive registers
pub fn decode_f64(registers: &[u16]) -> Result<f64> {
    let bytes = register_bytes::<8>(registers, "float64")?;
    Ok(f64::from_be_bytes(bytes))
}

/// Decode a 32-bit unsigned integer from two consecutive registers
pub fn decode_u32(registers: &[u16]) -> Result<u32> {
    let bytes = register_bytes::<4>(registers, "uint32")?;
    Ok(u32::from_be_bytes(bytes))
}

/// Decode a 64-bit unsigned integer from four consecutive registers
pub fn decode_u64(registers: &[u16]) -> Result<u64> {
    let bytes = register_bytes::<8>(registers, "uint64")?;
    Ok(u64::from_be_bytes(bytes))
}

/// Decode an ASCII string of `2·n` bytes from `n` registers.
///
/// Each register carries two characters, high byte first. Trailing NULs and
/// spaces are trimmed.
pub fn decode_string(registers: &[u16]) -> String {
    let mut s = String::with_capacity(registers.len() * 2);
    for &reg in registers {
        s.push(((reg >> 8) & 0xFF) as u8 as char);
        s.push((reg & 0xFF) as u8 as char);
    }
    s.trim_matches(['\0', ' ']).to_string()
}

/// Encode a 32-bit IEEE-754 float into a register pair
pub fn encode_f32(value: f32) -> [u16; 2] {
    let bytes = value.to_be_bytes();
    [
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ]
}

/// Collect `N` big-endian bytes from `N/2` registers
fn register_bytes<const N: usize>(registers: &[u16], type_name: &str) -> Result<[u8; N]> {
    if registers.len() < N / 2 {
        return Err(ModbusError::invalid_data(format!(
            "Not enough registers for {type_name}: {} (need {})",
            registers.len(),
            N / 2
        )));
    }
    let mut bytes = [0u8; N];
    for (i, &reg) in registers[..N / 2].iter().enumerate() {
        bytes[i * 2] = (reg >> 8) as u8;
        bytes[i * 2 + 1] = (reg & 0xFF) as u8;
    }
    Ok(bytes)
}

// ============================================================================
// Tests
// ============================================================================
