//! Register snapshot decoding
//!
//! Turns the two per-tick block reads into a typed, point-in-time sample of
//! the charger, and holds the identity fields read once at startup.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use evc_modbus::{decode_f32, decode_f64, decode_string, decode_u32};

use crate::error::{DriverError, Result};
use crate::registers::{socket, station};

/// Point-in-time sample of the charger, recreated each tick
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegisterSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Phase-to-neutral voltages L1..L3 (V)
    pub voltages: [f64; 3],
    /// Phase currents L1..L3 (A)
    pub currents: [f64; 3],
    /// Real power sum (W)
    pub power_w: f64,
    /// Lifetime energy delivered (Wh)
    pub energy_wh: f64,
    /// Raw mode-3 state string
    pub mode3_raw: String,
    /// Max current currently applied by the charger (A)
    pub applied_current_a: f64,
    /// Seconds before the setpoint falls back to the safe current
    pub setpoint_valid_secs: u32,
    /// Active phase count, normalised to 1 or 3
    pub phase_count: u8,
}

impl RegisterSnapshot {
    /// Decode the measurement block (socket slave, 306..=377) and the
    /// status/control block (station slave, 1201..=1215).
    ///
    /// `phase_coercions` is bumped whenever the undocumented phase-register
    /// value 2 is normalised to 3.
    pub fn decode(
        measurement: &[u16],
        control: &[u16],
        taken_at: DateTime<Utc>,
        phase_coercions: &mut u64,
    ) -> Result<Self> {
        if measurement.len() < socket::MEASUREMENT_BLOCK_LEN as usize {
            return Err(DriverError::Policy(format!(
                "short measurement block: {} registers",
                measurement.len()
            )));
        }
        if control.len() < station::CONTROL_BLOCK_LEN as usize {
            return Err(DriverError::Policy(format!(
                "short control block: {} registers",
                control.len()
            )));
        }

        let off = |reg: u16| (reg - socket::MEASUREMENT_BLOCK) as usize;
        let voltages = [
            f64::from(decode_f32(&measurement[off(socket::VOLTAGES)..])?),
            f64::from(decode_f32(&measurement[off(socket::VOLTAGES) + 2..])?),
            f64::from(decode_f32(&measurement[off(socket::VOLTAGES) + 4..])?),
        ];
        let currents = [
            f64::from(decode_f32(&measurement[off(socket::CURRENTS)..])?),
            f64::from(decode_f32(&measurement[off(socket::CURRENTS) + 2..])?),
            f64::from(decode_f32(&measurement[off(socket::CURRENTS) + 4..])?),
        ];
        let power_w = f64::from(decode_f32(&measurement[off(socket::REAL_POWER)..])?);
        let energy_wh = decode_f64(&measurement[off(socket::ENERGY_FORWARD)..])?;

        let coff = |reg: u16| (reg - station::CONTROL_BLOCK) as usize;
        let mode3_raw = decode_string(&control[coff(station::MODE3_STATE)..coff(station::MODE3_STATE) + 5]);
        let applied_current_a =
            f64::from(decode_f32(&control[coff(station::APPLIED_MAX_CURRENT)..])?);
        let setpoint_valid_secs = decode_u32(&control[coff(station::SETPOINT_VALID_TIME)..])?;

        let raw_phases = control[coff(station::PHASES)];
        let phase_count = normalise_phases(raw_phases, phase_coercions);

        Ok(Self {
            taken_at,
            voltages,
            currents,
            power_w,
            energy_wh,
            mode3_raw,
            applied_current_a,
            setpoint_valid_secs,
            phase_count,
        })
    }

    /// Per-phase power derived from voltage and current
    pub fn phase_power_w(&self, phase: usize) -> f64 {
        self.voltages[phase] * self.currents[phase]
    }

    /// Highest phase current, published as the charger's AC current
    pub fn max_current_a(&self) -> f64 {
        self.currents.iter().copied().fold(0.0, f64::max)
    }
}

/// Normalise the phase-count register to 1 or 3.
///
/// The register manual documents values 1 and 3 only; some firmware reports
/// 2, which is treated as 3 and counted so the coercion is visible in the
/// field.
fn normalise_phases(raw: u16, coercions: &mut u64) -> u8 {
    match raw {
        1 => 1,
        3 => 3,
        2 => {
            *coercions += 1;
            warn!("Phase register reports 2, treating as 3-phase");
            3
        },
        other => {
            warn!("Invalid phase count {}, defaulting to 3", other);
            3
        },
    }
}

/// Identity fields read once at startup
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ChargerIdentity {
    pub product_name: String,
    pub manufacturer: String,
    pub firmware_version: String,
    pub platform_type: String,
    pub serial_number: String,
}

impl ChargerIdentity {
    /// Displayed product name, manufacturer and platform combined
    pub fn display_name(&self) -> String {
        format!("{} {}", self.manufacturer, self.platform_type)
            .trim()
            .to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
