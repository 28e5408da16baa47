//! Charger status model
//!
//! Maps the raw IEC 61851 mode-3 state reported by the charger onto the
//! canonical EV-charger lifecycle, then layers mode-specific policy on top
//! (waiting for sun, waiting for a schedule window, low battery).

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::control::{ChargeMode, StartStop};

/// Raw IEC 61851-1 control-pilot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode3State {
    A,
    B1,
    B2,
    C1,
    C2,
    D1,
    D2,
    E,
    F,
}

impl Mode3State {
    /// Parse the state string read from the charger; `None` for
    /// unrecognised values
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Self::A),
            "B1" => Some(Self::B1),
            "B2" => Some(Self::B2),
            "C1" => Some(Self::C1),
            "C2" => Some(Self::C2),
            "D1" => Some(Self::D1),
            "D2" => Some(Self::D2),
            "E" => Some(Self::E),
            "F" => Some(Self::F),
            _ => None,
        }
    }

    /// Cable plugged in (any non-A, non-error state)
    pub fn is_plugged(&self) -> bool {
        !matches!(self, Self::A | Self::E | Self::F)
    }

    /// PWM on and the vehicle is drawing (or permitted to draw) current
    pub fn is_charging(&self) -> bool {
        matches!(self, Self::C2 | Self::D2)
    }
}

/// Canonical charger status published on the bus.
///
/// The numeric values are the wire representation of `/Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvChargerStatus {
    #[default]
    Disconnected,
    Connected,
    Charging,
    Charged,
    WaitSun,
    WaitStart,
    LowSoc,
}

impl EvChargerStatus {
    /// Bus representation of the status
    pub fn code(&self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connected => 1,
            Self::Charging => 2,
            Self::Charged => 3,
            Self::WaitSun => 4,
            Self::WaitStart => 5,
            Self::LowSoc => 6,
        }
    }

    /// Whether the cable is plugged in
    pub fn is_plugged(&self) -> bool {
        !matches!(self, Self::Disconnected)
    }

    /// Whether the poll cadence should be the active one
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Charging | Self::WaitSun | Self::WaitStart | Self::LowSoc
        )
    }
}

impl std::fmt::Display for EvChargerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connected => "CONNECTED",
            Self::Charging => "CHARGING",
            Self::Charged => "CHARGED",
            Self::WaitSun => "WAIT_SUN",
            Self::WaitStart => "WAIT_START",
            Self::LowSoc => "LOW_SOC",
        };
        write!(f, "{name}")
    }
}

/// Map a raw mode-3 state to the base canonical status.
///
/// `C1`/`D1` mean the cable is plugged but the PWM is off, which reads as
/// connected; `E`/`F` are error states reported as disconnected.
pub fn base_status(raw: &str) -> EvChargerStatus {
    match Mode3State::parse(raw) {
        Some(state) if state.is_charging() => EvChargerStatus::Charging,
        Some(state) if state.is_plugged() => EvChargerStatus::Connected,
        Some(_) => EvChargerStatus::Disconnected,
        None => {
            warn!("Unknown mode-3 state '{}', assuming disconnected", raw);
            EvChargerStatus::Disconnected
        },
    }
}

/// Inputs for the policy overlay applied after base mapping
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub mode: ChargeMode,
    pub start_stop: StartStop,
    /// Excess PV power available to the EV (W)
    pub excess_power_w: f64,
    /// Active phase count
    pub phases: u8,
    /// Minimum enable current (A)
    pub min_current: f64,
    pub nominal_voltage: f64,
    /// Battery state of charge, if known
    pub battery_soc: Option<f64>,
    pub min_battery_soc: f64,
    /// Whether a schedule window (or price window) covers the current time
    pub schedule_window_active: bool,
}

/// Apply mode-specific overrides to the base status
pub fn apply_policy(base: EvChargerStatus, ctx: &PolicyContext) -> EvChargerStatus {
    let connected = base.is_plugged();
    if !connected {
        return base;
    }

    match ctx.mode {
        ChargeMode::Manual => {
            if base == EvChargerStatus::Connected && ctx.start_stop == StartStop::Stopped {
                return EvChargerStatus::WaitStart;
            }
        },
        ChargeMode::Auto => {
            // Strictly below the threshold; SOC exactly at min_soc still charges
            if let Some(soc) = ctx.battery_soc {
                if soc < ctx.min_battery_soc {
                    return EvChargerStatus::LowSoc;
                }
            }
            if ctx.start_stop == StartStop::Stopped {
                if base == EvChargerStatus::Connected {
                    return EvChargerStatus::WaitStart;
                }
            } else if base == EvChargerStatus::Connected {
                let min_power = ctx.min_current * ctx.nominal_voltage * f64::from(ctx.phases);
                if ctx.excess_power_w < min_power {
                    return EvChargerStatus::WaitSun;
                }
            }
        },
        ChargeMode::Scheduled => {
            if base == EvChargerStatus::Connected
                && (ctx.start_stop == StartStop::Stopped || !ctx.schedule_window_active)
            {
                return EvChargerStatus::WaitStart;
            }
        },
    }

    base
}

/// Detects the end of charge: plugged in, nominally charging, but real power
/// stays under a small threshold for a sustained period.
#[derive(Debug, Default)]
pub struct ChargedDetector {
    below_since: Option<Instant>,
}

impl ChargedDetector {
    /// Feed one tick; returns true once the hold time has elapsed
    pub fn update(
        &mut self,
        status: EvChargerStatus,
        power_w: f64,
        threshold_w: f64,
        hold: Duration,
        now: Instant,
    ) -> bool {
        if status != EvChargerStatus::Charging || power_w >= threshold_w {
            self.below_since = None;
            return false;
        }

        let since = *self.below_since.get_or_insert(now);
        now.duration_since(since) >= hold
    }
}

// ============================================================================
// Tests
// ============================================================================
