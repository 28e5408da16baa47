//! Alfen NG9xx register map
//!
//! Addresses per the station's Modbus TCP slave interface. Measurement
//! registers live on the socket slave (typically 1), identity and control
//! registers on the station slave (typically 200). All multi-register
//! values are big-endian.

/// Socket slave: live measurements
pub mod socket {
    /// Contiguous measurement window read once per tick
    pub const MEASUREMENT_BLOCK: u16 = 306;
    pub const MEASUREMENT_BLOCK_LEN: u16 = 72; // 306..=377

    /// 6 x f32: L1-N, L2-N, L3-N, L1-L2, L2-L3, L3-L1 (V)
    pub const VOLTAGES: u16 = 306;
    /// 4 x f32: L1, L2, L3, Sum (A)
    pub const CURRENTS: u16 = 320;
    /// f32: real power sum (W)
    pub const REAL_POWER: u16 = 344;
    /// f64: real energy delivered sum (Wh)
    pub const ENERGY_FORWARD: u16 = 374;
}

/// Station slave: identity, status and control
pub mod station {
    /// 17 regs, string
    pub const PRODUCT_NAME: u16 = 100;
    pub const PRODUCT_NAME_LEN: u16 = 17;
    /// 5 regs, string
    pub const MANUFACTURER: u16 = 117;
    pub const MANUFACTURER_LEN: u16 = 5;
    /// 17 regs, string
    pub const FIRMWARE_VERSION: u16 = 123;
    pub const FIRMWARE_VERSION_LEN: u16 = 17;
    /// 17 regs, string
    pub const PLATFORM_TYPE: u16 = 140;
    pub const PLATFORM_TYPE_LEN: u16 = 17;
    /// 11 regs, string
    pub const SERIAL_NUMBER: u16 = 157;
    pub const SERIAL_NUMBER_LEN: u16 = 11;

    /// f32: station active max current (A)
    pub const MAX_CURRENT: u16 = 1100;

    /// Contiguous status/control window read once per tick
    pub const CONTROL_BLOCK: u16 = 1201;
    pub const CONTROL_BLOCK_LEN: u16 = 15; // 1201..=1215

    /// 5 regs, string: IEC 61851 mode-3 state
    pub const MODE3_STATE: u16 = 1201;
    /// f32: actual applied max current (A)
    pub const APPLIED_MAX_CURRENT: u16 = 1206;
    /// u32: remaining setpoint validity time (s)
    pub const SETPOINT_VALID_TIME: u16 = 1208;
    /// f32 R/W: Modbus-set max current (A)
    pub const AMPS_CONFIG: u16 = 1210;
    /// u16 R/W: phase count (1 or 3)
    pub const PHASES: u16 = 1215;
}
