//! Mode-driven control policy
//!
//! Computes the desired current and phase count from the per-tick setpoint
//! context: MANUAL passes the user's intent through a clamp, AUTO tracks
//! excess solar with enable/disable hysteresis, SCHEDULED follows time (or
//! price) windows. Phase selection is rate-limited and drains the current to
//! zero before switching under load.

pub mod schedule;
pub mod setpoint;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ControlsConfig;

/// Nominal phase-to-neutral voltage used for power/current conversion
pub const NOMINAL_VOLTAGE: f64 = 230.0;

/// Selected charging mode (bus representation: 0/1/2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargeMode {
    #[default]
    Manual,
    Auto,
    Scheduled,
}

impl ChargeMode {
    pub fn code(&self) -> u8 {
        match self {
            Self::Manual => 0,
            Self::Auto => 1,
            Self::Scheduled => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Manual),
            1 => Some(Self::Auto),
            2 => Some(Self::Scheduled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChargeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Manual => "MANUAL",
            Self::Auto => "AUTO",
            Self::Scheduled => "SCHEDULED",
        };
        write!(f, "{name}")
    }
}

/// Charge enable flag (bus representation: 0/1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartStop {
    #[default]
    Stopped,
    Enabled,
}

impl StartStop {
    pub fn code(&self) -> u8 {
        match self {
            Self::Stopped => 0,
            Self::Enabled => 1,
        }
    }

    pub fn from_bool(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Stopped
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// AUTO-mode inputs published by the energy system
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SystemReadings {
    /// Total PV generation (W)
    pub pv_power_w: f64,
    /// Non-EV house load (W)
    pub house_load_w: f64,
    /// Battery power; negative while discharging (W)
    pub battery_power_w: f64,
    /// Battery state of charge (%), if a battery is present
    pub battery_soc: Option<f64>,
}

impl SystemReadings {
    /// Instantaneous PV power left over for the EV.
    ///
    /// Battery discharge is house load in disguise and is subtracted;
    /// battery charging adapts to what the EV leaves behind and is ignored.
    pub fn excess_power_w(&self) -> f64 {
        let battery_export = (-self.battery_power_w).max(0.0);
        (self.pv_power_w - self.house_load_w - battery_export).max(0.0)
    }
}

/// Inputs consumed by the policy each tick, derived and discarded per tick
#[derive(Debug, Clone)]
pub struct SetpointContext {
    pub mode: ChargeMode,
    pub start_stop: StartStop,
    /// User-intended current in MANUAL mode (A)
    pub intended_current: f64,
    /// Station maximum from register 1100 (A)
    pub station_max: f64,
    pub system: SystemReadings,
    /// Active phase count reported by the charger
    pub phases: u8,
    /// Current from the matching schedule or price window, if any
    pub window_current: Option<f64>,
}

/// Computed target for this tick
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub amps: f64,
}

/// Upper clamp bound: the lesser of station max and the configured ceiling
pub fn current_ceiling(controls: &ControlsConfig, station_max: f64) -> f64 {
    station_max.min(controls.max_set_current).max(0.0)
}

/// Clamp a desired current into `[0, ceiling]`, coercing sub-minimum
/// requests to 0 so the charger sees "pause" rather than an illegal value.
pub fn effective_amps(desired: f64, controls: &ControlsConfig, station_max: f64) -> f64 {
    if !desired.is_finite() || desired < 0.0 {
        warn!("Coercing inconsistent setpoint {desired} to 0 A");
        return 0.0;
    }
    let clamped = desired.min(current_ceiling(controls, station_max));
    if clamped > 0.0 && clamped < controls.min_current {
        0.0
    } else {
        clamped
    }
}

/// Enable/disable hysteresis state for AUTO mode
#[derive(Debug, Default)]
pub struct AutoHysteresis {
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    charging: bool,
}

impl AutoHysteresis {
    pub fn is_charging(&self) -> bool {
        self.charging
    }

    fn reset(&mut self) {
        self.above_since = None;
        self.below_since = None;
        self.charging = false;
    }

    /// Feed the raw excess-derived current for this tick; returns the amps
    /// AUTO wants applied.
    fn update(&mut self, amps: f64, controls: &ControlsConfig, now: Instant) -> f64 {
        if !self.charging {
            if amps >= controls.enable_threshold {
                let since = *self.above_since.get_or_insert(now);
                if now.duration_since(since) >= Duration::from_secs(controls.enable_hold_secs) {
                    self.charging = true;
                    self.below_since = None;
                    return amps.max(controls.min_current);
                }
            } else {
                self.above_since = None;
            }
            0.0
        } else if amps < controls.min_current {
            let since = *self.below_since.get_or_insert(now);
            if now.duration_since(since) >= Duration::from_secs(controls.disable_hold_secs) {
                self.reset();
                0.0
            } else {
                // Ride through the dip at the minimum current
                controls.min_current
            }
        } else {
            self.below_since = None;
            amps
        }
    }
}

/// Compute the desired current for this tick.
///
/// The result is already clamped into `[0, min(station_max,
/// max_set_current)]` with sub-minimum values coerced to 0.
pub fn desired_current(
    ctx: &SetpointContext,
    controls: &ControlsConfig,
    hysteresis: &mut AutoHysteresis,
    now: Instant,
) -> Target {
    let amps = match ctx.mode {
        ChargeMode::Manual => {
            if ctx.start_stop.is_enabled() {
                ctx.intended_current
            } else {
                0.0
            }
        },
        ChargeMode::Auto => {
            if !ctx.start_stop.is_enabled() {
                hysteresis.reset();
                0.0
            } else if ctx
                .system
                .battery_soc
                .is_some_and(|soc| soc < controls.min_battery_soc)
            {
                hysteresis.reset();
                0.0
            } else {
                let phases = f64::from(ctx.phases.max(1));
                let raw = ctx.system.excess_power_w() / (phases * NOMINAL_VOLTAGE);
                hysteresis.update(raw, controls, now)
            }
        },
        ChargeMode::Scheduled => {
            if ctx.start_stop.is_enabled() {
                ctx.window_current.unwrap_or(0.0)
            } else {
                0.0
            }
        },
    };

    Target {
        amps: effective_amps(amps, controls, ctx.station_max),
    }
}

/// What the phase planner wants this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhaseAction {
    /// Nothing to do
    None,
    /// Hold the current at 0 A while draining before a switch
    HoldZero,
    /// Write the phase register now
    Switch(u8),
}

/// Phase-count selection with rate limiting and drain-before-switch.
///
/// The charger must not see a contactor switch under load: while charging,
/// the sequence is write 0 A, wait the drain time, then write the phase
/// register and let the setpoint writer resume the desired current.
#[derive(Debug, Default)]
pub struct PhasePlanner {
    last_switch_at: Option<Instant>,
    draining: Option<(u8, Instant)>,
}

impl PhasePlanner {
    /// Phase count the policy wants for `desired_amps`
    fn wanted_phases(&self, desired_amps: f64, active_phases: u8, controls: &ControlsConfig) -> u8 {
        if desired_amps > controls.single_phase_max {
            3
        } else if desired_amps > 0.0
            && desired_amps <= controls.single_phase_max - controls.phase_hysteresis
        {
            1
        } else {
            active_phases
        }
    }

    fn rate_limited(&self, now: Instant, controls: &ControlsConfig) -> bool {
        self.last_switch_at.is_some_and(|at| {
            now.duration_since(at) < Duration::from_secs(controls.phase_switch_interval_secs)
        })
    }

    /// Decide the phase action for this tick
    pub fn plan(
        &mut self,
        desired_amps: f64,
        active_phases: u8,
        charging: bool,
        now: Instant,
        controls: &ControlsConfig,
    ) -> PhaseAction {
        if let Some((target, zero_since)) = self.draining {
            if now.duration_since(zero_since) >= Duration::from_secs(controls.phase_drain_secs) {
                self.draining = None;
                self.last_switch_at = Some(now);
                return PhaseAction::Switch(target);
            }
            return PhaseAction::HoldZero;
        }

        let wanted = self.wanted_phases(desired_amps, active_phases, controls);
        if wanted == active_phases || self.rate_limited(now, controls) {
            return PhaseAction::None;
        }

        if charging {
            self.draining = Some((wanted, now));
            PhaseAction::HoldZero
        } else {
            self.last_switch_at = Some(now);
            PhaseAction::Switch(wanted)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn controls() -> ControlsConfig {
        ControlsConfig::default()
    }

    fn ctx(mode: ChargeMode) -> SetpointContext {
        SetpointContext {
            mode,
            start_stop: StartStop::Enabled,
            intended_current: 10.0,
            station_max: 32.0,
            system: SystemReadings::default(),
            phases: 3,
            window_current: None,
        }
    }

    #[test]
    fn test_manual_clamps_to_station_max() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let mut c = ctx(ChargeMode::Manual);
        c.intended_current = 40.0;
        c.station_max = 25.0;

        let target = desired_current(&c, &controls, &mut hysteresis, Instant::now());
        assert!((target.amps - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_manual_disabled_is_zero() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let mut c = ctx(ChargeMode::Manual);
        c.start_stop = StartStop::Stopped;

        let target = desired_current(&c, &controls, &mut hysteresis, Instant::now());
        assert_eq!(target.amps, 0.0);
    }

    #[test]
    fn test_sub_minimum_request_writes_zero() {
        let controls = controls();
        // 4 A is below the 6 A enable minimum
        assert_eq!(effective_amps(4.0, &controls, 32.0), 0.0);
        assert!((effective_amps(6.0, &controls, 32.0) - 6.0).abs() < 1e-9);
        assert_eq!(effective_amps(0.0, &controls, 32.0), 0.0);
    }

    #[test]
    fn test_negative_and_nan_setpoints_are_coerced() {
        let controls = controls();
        assert_eq!(effective_amps(-3.0, &controls, 32.0), 0.0);
        assert_eq!(effective_amps(f64::NAN, &controls, 32.0), 0.0);
    }

    #[test]
    fn test_excess_power_subtracts_battery_discharge() {
        let readings = SystemReadings {
            pv_power_w: 5000.0,
            house_load_w: 2000.0,
            battery_power_w: -500.0,
            battery_soc: None,
        };
        assert!((readings.excess_power_w() - 2500.0).abs() < 1e-9);

        // Battery charging does not reduce the excess
        let readings = SystemReadings {
            pv_power_w: 5000.0,
            house_load_w: 2000.0,
            battery_power_w: 1500.0,
            battery_soc: None,
        };
        assert!((readings.excess_power_w() - 3000.0).abs() < 1e-9);
    }

    #[test]
    fn test_auto_hysteresis_enable_hold() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let t0 = Instant::now();
        let mut c = ctx(ChargeMode::Auto);

        // 3 kW excess: 4.35 A, below the enable threshold
        c.system.pv_power_w = 5000.0;
        c.system.house_load_w = 2000.0;
        let target = desired_current(&c, &controls, &mut hysteresis, t0);
        assert_eq!(target.amps, 0.0);

        // 7 kW excess: 10.14 A, but the hold time has not elapsed yet
        c.system.pv_power_w = 8000.0;
        c.system.house_load_w = 1000.0;
        let target = desired_current(&c, &controls, &mut hysteresis, t0 + Duration::from_secs(1));
        assert_eq!(target.amps, 0.0);

        // After 30 s of sustained excess, charging begins near 10.14 A
        let target = desired_current(&c, &controls, &mut hysteresis, t0 + Duration::from_secs(32));
        assert!((target.amps - 7000.0 / (3.0 * 230.0)).abs() < 0.01);
        assert!(hysteresis.is_charging());
    }

    #[test]
    fn test_auto_hysteresis_disable_hold() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let t0 = Instant::now();
        let mut c = ctx(ChargeMode::Auto);

        // Get charging
        c.system.pv_power_w = 8000.0;
        c.system.house_load_w = 1000.0;
        desired_current(&c, &controls, &mut hysteresis, t0);
        desired_current(&c, &controls, &mut hysteresis, t0 + Duration::from_secs(31));
        assert!(hysteresis.is_charging());

        // Excess collapses; ride through at the minimum current first
        c.system.pv_power_w = 1000.0;
        let t1 = t0 + Duration::from_secs(60);
        let target = desired_current(&c, &controls, &mut hysteresis, t1);
        assert!((target.amps - controls.min_current).abs() < 1e-9);

        // Still low after the disable hold: stop
        let target = desired_current(&c, &controls, &mut hysteresis, t1 + Duration::from_secs(61));
        assert_eq!(target.amps, 0.0);
        assert!(!hysteresis.is_charging());
    }

    #[test]
    fn test_auto_low_soc_forces_zero() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let mut c = ctx(ChargeMode::Auto);
        c.system.pv_power_w = 9000.0;
        c.system.battery_soc = Some(10.0);

        let mut controls_low = controls.clone();
        controls_low.min_battery_soc = 20.0;
        let target = desired_current(&c, &controls_low, &mut hysteresis, Instant::now());
        assert_eq!(target.amps, 0.0);

        // SOC exactly at the threshold still charges (strictly-below rule)
        c.system.battery_soc = Some(20.0);
        let t0 = Instant::now();
        desired_current(&c, &controls_low, &mut hysteresis, t0);
        let target =
            desired_current(&c, &controls_low, &mut hysteresis, t0 + Duration::from_secs(31));
        assert!(target.amps > 0.0);
    }

    #[test]
    fn test_scheduled_outside_window_is_zero() {
        let controls = controls();
        let mut hysteresis = AutoHysteresis::default();
        let mut c = ctx(ChargeMode::Scheduled);

        c.window_current = None;
        let target = desired_current(&c, &controls, &mut hysteresis, Instant::now());
        assert_eq!(target.amps, 0.0);

        c.window_current = Some(16.0);
        let target = desired_current(&c, &controls, &mut hysteresis, Instant::now());
        assert!((target.amps - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_phase_planner_switches_up_immediately_when_idle() {
        let controls = controls();
        let mut planner = PhasePlanner::default();
        let now = Instant::now();

        // 20 A on one phase wants three phases; not charging, so switch now
        let action = planner.plan(20.0, 1, false, now, &controls);
        assert_eq!(action, PhaseAction::Switch(3));
    }

    #[test]
    fn test_phase_planner_rate_limit() {
        let controls = controls();
        let mut planner = PhasePlanner::default();
        let t0 = Instant::now();

        assert_eq!(planner.plan(20.0, 1, false, t0, &controls), PhaseAction::Switch(3));
        // Wants to go back down right away, but the 60 s limit holds
        assert_eq!(
            planner.plan(8.0, 3, false, t0 + Duration::from_secs(10), &controls),
            PhaseAction::None
        );
        assert_eq!(
            planner.plan(8.0, 3, false, t0 + Duration::from_secs(61), &controls),
            PhaseAction::Switch(1)
        );
    }

    #[test]
    fn test_phase_planner_drains_before_switching_under_load() {
        let controls = controls();
        let mut planner = PhasePlanner::default();
        let t0 = Instant::now();

        // Charging on three phases at 8 A: wants one phase, must drain first
        assert_eq!(planner.plan(8.0, 3, true, t0, &controls), PhaseAction::HoldZero);
        assert_eq!(
            planner.plan(8.0, 3, true, t0 + Duration::from_secs(2), &controls),
            PhaseAction::HoldZero
        );
        assert_eq!(
            planner.plan(8.0, 3, true, t0 + Duration::from_secs(6), &controls),
            PhaseAction::Switch(1)
        );
    }

    #[test]
    fn test_phase_planner_dead_band_keeps_current_phases() {
        let controls = controls();
        let mut planner = PhasePlanner::default();
        // 15 A sits between 14 and 16: keep whatever is active
        assert_eq!(
            planner.plan(15.0, 3, false, Instant::now(), &controls),
            PhaseAction::None
        );
        assert_eq!(
            planner.plan(15.0, 1, false, Instant::now(), &controls),
            PhaseAction::None
        );
    }
}
