//! Setpoint writer & watchdog
//!
//! Writes the desired current to the charger's amps-config register when it
//! drifts past the tolerance, and unconditionally once the watchdog interval
//! elapses: the charger falls back to its safe current when no write arrives
//! within its validity window. Every write is verified by reading the
//! register back.

use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use evc_modbus::{decode_f32, encode_f32};

use crate::config::{ControlsConfig, RegisterOverrides};
use crate::error::{DriverError, Result};
use crate::port::RegisterBus;

/// Outcome of a tick's apply step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing was due
    Skipped,
    /// Written and verified
    Written,
}

/// Tracks the last confirmed write and decides when the next one is due
#[derive(Debug, Default)]
pub struct SetpointWriter {
    last_written_amps: Option<f64>,
    last_written_at: Option<Instant>,
}

impl SetpointWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_written_amps(&self) -> Option<f64> {
        self.last_written_amps
    }

    pub fn last_written_at(&self) -> Option<Instant> {
        self.last_written_at
    }

    /// Seed the tracker from persisted state so a restart does not rewrite
    /// an unchanged setpoint on its first ticks
    pub fn seed(&mut self, amps: f64, at: Instant) {
        self.last_written_amps = Some(amps);
        self.last_written_at = Some(at);
    }

    /// Whether a write is due: tolerance breach or watchdog expiry
    pub fn needs_write(&self, desired: f64, controls: &ControlsConfig, now: Instant) -> bool {
        let Some(last_amps) = self.last_written_amps else {
            return true;
        };
        let Some(last_at) = self.last_written_at else {
            return true;
        };
        (desired - last_amps).abs() > controls.current_tolerance
            || now.duration_since(last_at) > controls.watchdog_interval()
    }

    /// Apply `desired` amps if due; verify by read-back.
    ///
    /// On verification failure the tracker is cleared so the next tick
    /// retries regardless of tolerance.
    pub async fn apply<B: RegisterBus>(
        &mut self,
        bus: &mut B,
        station_slave: u8,
        registers: &RegisterOverrides,
        controls: &ControlsConfig,
        desired: f64,
        now: Instant,
    ) -> Result<WriteOutcome> {
        if !self.needs_write(desired, controls, now) {
            debug!(
                "No setpoint update needed (last {:.2} A, proposed {:.2} A)",
                self.last_written_amps.unwrap_or(-1.0),
                desired
            );
            return Ok(WriteOutcome::Skipped);
        }

        match self
            .write_verified(bus, station_slave, registers.amps_config, controls, desired)
            .await
        {
            Ok(()) => {
                self.last_written_amps = Some(desired);
                self.last_written_at = Some(now);
                info!("Set charge current to {:.2} A", desired);
                Ok(WriteOutcome::Written)
            },
            Err(e) => {
                // Force a retry on the next tick
                self.last_written_amps = None;
                Err(e)
            },
        }
    }

    /// Write the amps register as f32 and read it back until it sticks
    async fn write_verified<B: RegisterBus>(
        &mut self,
        bus: &mut B,
        slave: u8,
        register: u16,
        controls: &ControlsConfig,
        amps: f64,
    ) -> Result<()> {
        let payload = encode_f32(amps as f32);
        let mut read_back = f64::NAN;

        for attempt in 1..=controls.max_retries.max(1) {
            bus.write_multiple(slave, register, &payload).await?;

            sleep(Duration::from_millis(controls.verify_delay_ms)).await;
            let regs = bus.read_holding(slave, register, 2).await?;
            read_back = f64::from(decode_f32(&regs)?);

            if (read_back - amps).abs() <= controls.current_tolerance {
                return Ok(());
            }
            warn!(
                "Setpoint verification mismatch (attempt {}/{}): wrote {:.2}, read {:.2}",
                attempt, controls.max_retries, amps, read_back
            );
        }

        Err(DriverError::Verification {
            register,
            written: amps,
            read_back,
        })
    }

    /// Write the phase-count register (single u16)
    pub async fn write_phases<B: RegisterBus>(
        &mut self,
        bus: &mut B,
        station_slave: u8,
        registers: &RegisterOverrides,
        phases: u8,
    ) -> Result<()> {
        bus.write_single(station_slave, registers.phases, u16::from(phases))
            .await?;
        info!("Requested {}-phase charging", phases);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::fake::FakeCharger;

    const STATION: u8 = 200;

    fn setup() -> (FakeCharger, RegisterOverrides, ControlsConfig) {
        let mut controls = ControlsConfig::default();
        controls.verify_delay_ms = 0;
        (FakeCharger::new(), RegisterOverrides::default(), controls)
    }

    #[tokio::test]
    async fn test_first_write_goes_out_and_verifies() {
        let (mut charger, registers, controls) = setup();
        let mut writer = SetpointWriter::new();

        let outcome = writer
            .apply(&mut charger, STATION, &registers, &controls, 10.0, Instant::now())
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(charger.writes_to(STATION, 1210), 1);
        assert!((charger.get_f32(STATION, 1210) - 10.0).abs() < 0.01);
        assert_eq!(writer.last_written_amps(), Some(10.0));
    }

    #[tokio::test]
    async fn test_unchanged_setpoint_is_not_rewritten() {
        let (mut charger, registers, controls) = setup();
        let mut writer = SetpointWriter::new();
        let t0 = Instant::now();

        writer
            .apply(&mut charger, STATION, &registers, &controls, 16.0, t0)
            .await
            .unwrap();

        // Three ticks inside the watchdog interval with the same value
        for secs in [1, 2, 3] {
            let outcome = writer
                .apply(
                    &mut charger,
                    STATION,
                    &registers,
                    &controls,
                    16.0,
                    t0 + Duration::from_secs(secs),
                )
                .await
                .unwrap();
            assert_eq!(outcome, WriteOutcome::Skipped);
        }
        assert_eq!(charger.writes_to(STATION, 1210), 1);
    }

    #[tokio::test]
    async fn test_watchdog_refreshes_unchanged_setpoint() {
        let (mut charger, registers, controls) = setup();
        let mut writer = SetpointWriter::new();
        let t0 = Instant::now();

        writer
            .apply(&mut charger, STATION, &registers, &controls, 16.0, t0)
            .await
            .unwrap();

        // 40 s later the value is unchanged but the 30 s watchdog has expired
        let outcome = writer
            .apply(
                &mut charger,
                STATION,
                &registers,
                &controls,
                16.0,
                t0 + Duration::from_secs(40),
            )
            .await
            .unwrap();

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(charger.writes_to(STATION, 1210), 2);
    }

    #[tokio::test]
    async fn test_tolerance_gate() {
        let (mut charger, registers, controls) = setup();
        let mut writer = SetpointWriter::new();
        let t0 = Instant::now();

        writer
            .apply(&mut charger, STATION, &registers, &controls, 10.0, t0)
            .await
            .unwrap();

        // 0.3 A drift is inside the 0.5 A tolerance
        let outcome = writer
            .apply(
                &mut charger,
                STATION,
                &registers,
                &controls,
                10.3,
                t0 + Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped);

        // 1.0 A drift is not
        let outcome = writer
            .apply(
                &mut charger,
                STATION,
                &registers,
                &controls,
                11.0,
                t0 + Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[tokio::test]
    async fn test_verification_failure_surfaces_and_forces_retry() {
        let (mut charger, registers, controls) = setup();
        charger.drop_writes = true;
        charger.set_f32(STATION, 1210, 0.0);
        let mut writer = SetpointWriter::new();
        let t0 = Instant::now();

        let err = writer
            .apply(&mut charger, STATION, &registers, &controls, 10.0, t0)
            .await
            .unwrap_err();

        assert!(matches!(err, DriverError::Verification { register: 1210, .. }));
        // All verification attempts went to the wire
        assert_eq!(charger.writes_to(STATION, 1210), controls.max_retries as usize);
        // Next tick retries even though the desired value did not change
        assert!(writer.needs_write(10.0, &controls, t0 + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn test_write_phases() {
        let (mut charger, registers, _controls) = setup();
        let mut writer = SetpointWriter::new();

        writer
            .write_phases(&mut charger, STATION, &registers, 3)
            .await
            .unwrap();

        assert_eq!(charger.get_u16(STATION, 1215), 3);
        assert_eq!(charger.writes_to(STATION, 1215), 1);
    }
}
