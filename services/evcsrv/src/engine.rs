//! Control engine
//!
//! The single owner task: a periodic tick polls the charger, maps status,
//! accounts the session, computes the policy target and applies it; user
//! commands from the bus or the HTTP API arrive through a bounded inbox and
//! run between ticks. All engine state lives inside this task, so nothing
//! here needs a lock.
//!
//! ```text
//! ┌──────────┐   commands   ┌─────────────────────────────┐
//! │ API /bus │─────────────►│ Engine (one task)           │
//! └──────────┘              │  tick: read → decode →      │
//!                           │  status → session → policy  │
//! ┌──────────┐   readings   │  → setpoint → publish       │
//! │ system   │─────────────►│                             │
//! └──────────┘              └──────────────┬──────────────┘
//!                                          │ watch / chart ring
//!                                          ▼
//!                                   status consumers
//! ```

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use evc_modbus::{decode_f32, decode_string, encode_f32};

use crate::bus::{paths, BusPublisher, BusValue, ChartPoint, ChartRing};
use crate::config::DriverConfig;
use crate::control::schedule::{active_item, ScheduleItem};
use crate::control::setpoint::SetpointWriter;
use crate::control::{
    current_ceiling, desired_current, AutoHysteresis, ChargeMode, PhaseAction, PhasePlanner,
    SetpointContext, StartStop, SystemReadings,
};
use crate::error::{DriverError, Result};
use crate::persistence::{PersistedState, StateStore};
use crate::port::RegisterBus;
use crate::pricing::feed::PriceFeed;
use crate::pricing::{charge_now, price_at, PricePoint, PriceStrategy};
use crate::registers::{socket, station};
use crate::session::{SessionEvent, SessionTracker};
use crate::status::{apply_policy, base_status, ChargedDetector, EvChargerStatus, PolicyContext};
use crate::telemetry::{ChargerIdentity, RegisterSnapshot};

/// Persisted sessions older than this are discarded at startup
const SESSION_RESUME_MAX_AGE_HOURS: i64 = 24;

/// Station max current is refreshed every Nth tick
const STATION_MAX_REFRESH_TICKS: u64 = 10;

/// Reconnect cooldown cap after repeated read failures
const RECONNECT_COOLDOWN_CAP: Duration = Duration::from_secs(30);

/// Hard deadline for the shutdown sequence
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

/// User commands consumed between ticks
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetMode(ChargeMode),
    SetStartStop(bool),
    SetCurrent(f64),
}

/// Cloneable handle used by the API and the bus binding
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StatusReport>,
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DriverError::EngineGone)
    }

    /// Latest published status snapshot
    pub fn report(&self) -> StatusReport {
        self.status.borrow().clone()
    }
}

/// Snapshot published after every tick
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusReport {
    /// Whether the charger answered the last poll
    pub connected: bool,
    pub status: EvChargerStatus,
    pub status_code: u8,
    pub mode: u8,
    pub start_stop: u8,
    pub set_current: f64,
    pub max_current: f64,
    pub applied_current: f64,
    pub desired_current: f64,
    pub phases: u8,
    /// Seconds before the charger falls back to its safe current
    pub setpoint_valid_secs: u32,
    pub voltages: [f64; 3],
    pub currents: [f64; 3],
    pub power_w: f64,
    pub session_energy_wh: f64,
    pub charging_time_secs: i64,
    pub session_cost: Option<f64>,
    pub lifetime_energy_wh: f64,
    pub product_name: String,
    pub firmware_version: String,
    pub serial: String,
    /// Times the undocumented phase-register value 2 was normalised to 3
    pub phase_coercions: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The control engine; owns the Modbus port and all mutable state
pub struct Engine<B: RegisterBus> {
    config: DriverConfig,
    schedule: Vec<ScheduleItem>,
    bus: B,
    publisher: Arc<dyn BusPublisher>,
    readings_rx: watch::Receiver<SystemReadings>,
    commands_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<StatusReport>,
    chart: Arc<RwLock<ChartRing>>,
    store: StateStore,
    state: PersistedState,
    sessions: SessionTracker,
    hysteresis: AutoHysteresis,
    planner: PhasePlanner,
    writer: SetpointWriter,
    charged: ChargedDetector,
    feed: Option<PriceFeed>,
    strategy: Option<PriceStrategy>,
    prices: Vec<PricePoint>,
    identity: ChargerIdentity,
    station_max: f64,
    phase_coercions: u64,
    tick_count: u64,
    last_good_read: Option<Instant>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    last_flush: Option<Instant>,
    last_tick_at: Option<DateTime<Utc>>,
    shutdown: CancellationToken,
}

impl<B: RegisterBus> Engine<B> {
    /// Build the engine and its handle
    pub fn new(
        config: DriverConfig,
        bus: B,
        publisher: Arc<dyn BusPublisher>,
        readings_rx: watch::Receiver<SystemReadings>,
        shutdown: CancellationToken,
    ) -> Result<(Self, EngineHandle, Arc<RwLock<ChartRing>>)> {
        let (commands_tx, commands_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(StatusReport::default());
        let chart = Arc::new(RwLock::new(ChartRing::new(config.api.chart_points)));

        let (feed, strategy) = if config.pricing.enabled {
            (
                Some(PriceFeed::new(&config.pricing)?),
                Some(PriceStrategy::from_config(&config.pricing)?),
            )
        } else {
            (None, None)
        };

        let schedule = config
            .schedule
            .iter()
            .map(ScheduleItem::from_config)
            .collect();
        let store = StateStore::new(&config.persistence.state_file);
        let station_max = config.defaults.station_max_current;

        let engine = Self {
            schedule,
            bus,
            publisher,
            readings_rx,
            commands_rx,
            status_tx,
            chart: chart.clone(),
            store,
            state: PersistedState::default(),
            sessions: SessionTracker::new(),
            hysteresis: AutoHysteresis::default(),
            planner: PhasePlanner::default(),
            writer: SetpointWriter::new(),
            charged: ChargedDetector::default(),
            feed,
            strategy,
            prices: Vec::new(),
            identity: ChargerIdentity::default(),
            station_max,
            phase_coercions: 0,
            tick_count: 0,
            last_good_read: None,
            consecutive_failures: 0,
            cooldown_until: None,
            last_flush: None,
            last_tick_at: None,
            shutdown,
            config,
        };

        let handle = EngineHandle {
            commands: commands_tx,
            status: status_rx,
        };
        Ok((engine, handle, chart))
    }

    /// Run until shutdown. Ticks never overlap: the next tick is scheduled
    /// from the completion of the previous one and fires immediately when a
    /// tick overruns its interval.
    pub async fn run(mut self) -> Result<()> {
        self.startup().await;

        loop {
            let started = tokio::time::Instant::now();
            self.tick().await;
            let deadline = started + self.poll_interval();

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        self.shutdown_sequence().await;
                        return Ok(());
                    },
                    command = self.commands_rx.recv() => match command {
                        Some(command) => self.handle_command(command).await,
                        None => {
                            info!("Command channel closed, shutting down");
                            self.shutdown_sequence().await;
                            return Ok(());
                        },
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }
    }

    /// Poll cadence: fast while the charger has a car attached
    fn poll_interval(&self) -> Duration {
        if self.state.status.is_active() {
            Duration::from_millis(self.config.poll.active_interval_ms)
        } else {
            Duration::from_millis(self.config.poll.idle_interval_ms)
        }
    }

    /// Restore state, read identity registers and resume a recent session
    async fn startup(&mut self) {
        let first_run = !self.store.path().exists();
        self.state = self.store.load();
        if first_run {
            self.state.mode =
                ChargeMode::from_code(self.config.defaults.mode).unwrap_or_default();
            self.state.start_stop = StartStop::from_bool(self.config.defaults.start_stop);
            self.state.set_current = self.config.defaults.intended_set_current;
        }
        self.state.set_current = self
            .state
            .set_current
            .clamp(0.0, self.config.controls.max_set_current);
        if self.state.set_current == 0.0 {
            self.state.set_current = self.config.defaults.intended_set_current;
        }
        if self.state.applied_current > 0.0 {
            // Avoid rewriting an unchanged setpoint right after a restart
            self.writer.seed(self.state.applied_current, Instant::now());
        }

        self.read_identity().await;
        self.refresh_station_max().await;

        // Resume the persisted session only if the charger still reports a
        // plugged state
        if let Some(session) = self.state.session.take() {
            let plugged = match self.read_mode3().await {
                Ok(raw) => base_status(&raw).is_plugged(),
                Err(e) => {
                    warn!("Cannot read charger state at startup: {e}");
                    false
                },
            };
            self.sessions
                .restore(session, plugged, Utc::now(), SESSION_RESUME_MAX_AGE_HOURS);
            self.state.session = self.sessions.current().cloned();
        }

        info!(
            "Engine started: mode {}, start/stop {}, set current {:.1} A",
            self.state.mode,
            self.state.start_stop.code(),
            self.state.set_current
        );
    }

    async fn read_identity(&mut self) {
        let slave = self.config.modbus.station_slave_id;
        let reads = [
            (station::PRODUCT_NAME, station::PRODUCT_NAME_LEN),
            (station::MANUFACTURER, station::MANUFACTURER_LEN),
            (station::FIRMWARE_VERSION, station::FIRMWARE_VERSION_LEN),
            (station::PLATFORM_TYPE, station::PLATFORM_TYPE_LEN),
            (station::SERIAL_NUMBER, station::SERIAL_NUMBER_LEN),
        ];

        let mut values = Vec::with_capacity(reads.len());
        for (address, count) in reads {
            match self.bus.read_holding(slave, address, count).await {
                Ok(regs) => values.push(decode_string(&regs)),
                Err(e) => {
                    warn!("Identity read at {address} failed: {e}");
                    values.push(String::new());
                },
            }
        }

        self.identity = ChargerIdentity {
            product_name: values[0].clone(),
            manufacturer: values[1].clone(),
            firmware_version: values[2].clone(),
            platform_type: values[3].clone(),
            serial_number: values[4].clone(),
        };
        if !self.identity.product_name.is_empty() {
            info!(
                "Charger: {} ({}, firmware {})",
                self.identity.display_name(),
                self.identity.serial_number,
                self.identity.firmware_version
            );
        }

        // Identity paths change only across firmware updates; publish once
        self.publisher
            .publish(vec![
                (
                    paths::PRODUCT_NAME.into(),
                    BusValue::from(self.identity.display_name()),
                ),
                (
                    paths::FIRMWARE_VERSION.into(),
                    BusValue::from(self.identity.firmware_version.clone()),
                ),
                (
                    paths::SERIAL.into(),
                    BusValue::from(self.identity.serial_number.clone()),
                ),
            ])
            .await;
    }

    async fn read_mode3(&mut self) -> Result<String> {
        let regs = self
            .bus
            .read_holding(self.config.modbus.station_slave_id, station::MODE3_STATE, 5)
            .await?;
        Ok(decode_string(&regs))
    }

    /// Refresh the station maximum from register 1100; keep the previous
    /// value (initially the configured fallback) when the read fails
    async fn refresh_station_max(&mut self) {
        match self
            .bus
            .read_holding(self.config.modbus.station_slave_id, station::MAX_CURRENT, 2)
            .await
        {
            Ok(regs) => match decode_f32(&regs) {
                Ok(value) if value.is_finite() && value > 0.0 => {
                    self.station_max = f64::from(value);
                },
                _ => warn!("Implausible station max current, keeping {:.1} A", self.station_max),
            },
            Err(e) => {
                warn!(
                    "Station max read failed, keeping {:.1} A: {e}",
                    self.station_max
                );
            },
        }
    }

    /// One tick of the poll pipeline
    async fn tick(&mut self) {
        self.tick_count += 1;
        let now = Instant::now();

        if let Some(until) = self.cooldown_until {
            if now < until {
                debug!("Reconnect cooldown, skipping poll");
                return;
            }
        }

        if self.tick_count % STATION_MAX_REFRESH_TICKS == 1 {
            self.refresh_station_max().await;
        }

        let blocks = self.read_blocks().await;
        match blocks {
            Ok((measurement, control)) => {
                self.consecutive_failures = 0;
                self.cooldown_until = None;
                self.last_good_read = Some(now);
                if let Err(e) = self.process(&measurement, &control, now).await {
                    warn!("Tick error: {e}");
                }
            },
            Err(e) => self.handle_read_failure(e, now).await,
        }
    }

    /// The tick's two block reads: measurements on the socket slave, the
    /// status/control window on the station slave
    async fn read_blocks(&mut self) -> Result<(Vec<u16>, Vec<u16>)> {
        let measurement = self
            .bus
            .read_holding(
                self.config.modbus.socket_slave_id,
                socket::MEASUREMENT_BLOCK,
                socket::MEASUREMENT_BLOCK_LEN,
            )
            .await?;
        let control = self
            .bus
            .read_holding(
                self.config.modbus.station_slave_id,
                station::CONTROL_BLOCK,
                station::CONTROL_BLOCK_LEN,
            )
            .await?;
        Ok((measurement, control))
    }

    async fn process(&mut self, measurement: &[u16], control: &[u16], now: Instant) -> Result<()> {
        let wall_now = Utc::now();
        let snapshot = RegisterSnapshot::decode(
            measurement,
            control,
            wall_now,
            &mut self.phase_coercions,
        )?;
        let readings = *self.readings_rx.borrow();

        // Refresh the price horizon; the strategy itself stays pure
        if self.feed.is_some() {
            self.refresh_prices().await;
        }
        let price_now = price_at(wall_now, &self.prices);
        let window_current = self.window_current(wall_now);

        // Status mapping: base table, then policy overrides
        let base = base_status(&snapshot.mode3_raw);
        let ctx = PolicyContext {
            mode: self.state.mode,
            start_stop: self.state.start_stop,
            excess_power_w: readings.excess_power_w(),
            phases: snapshot.phase_count,
            min_current: self.config.controls.min_current,
            nominal_voltage: crate::control::NOMINAL_VOLTAGE,
            battery_soc: readings.battery_soc,
            min_battery_soc: self.config.controls.min_battery_soc,
            schedule_window_active: window_current.is_some(),
        };
        let mut status = apply_policy(base, &ctx);
        if self.charged.update(
            status,
            snapshot.power_w,
            self.config.controls.charged_power_threshold_w,
            Duration::from_secs(self.config.controls.charged_hold_secs),
            now,
        ) {
            status = EvChargerStatus::Charged;
        }

        // Session accounting
        let event = self
            .sessions
            .update(status.is_plugged(), snapshot.energy_wh, wall_now);
        if let (Some(price), Some(last)) = (price_now, self.last_tick_at) {
            let tick_secs = (wall_now - last).num_milliseconds().max(0) as f64 / 1000.0;
            self.sessions
                .accumulate_cost(snapshot.power_w, tick_secs, price);
        }
        self.last_tick_at = Some(wall_now);

        // Policy target
        let target = desired_current(
            &SetpointContext {
                mode: self.state.mode,
                start_stop: self.state.start_stop,
                intended_current: self.state.set_current,
                station_max: self.station_max,
                system: readings,
                phases: snapshot.phase_count,
                window_current,
            },
            &self.config.controls,
            &mut self.hysteresis,
            now,
        );

        // Phase selection, draining to zero before a switch under load
        let mut desired = target.amps;
        match self.planner.plan(
            target.amps,
            snapshot.phase_count,
            status == EvChargerStatus::Charging,
            now,
            &self.config.controls,
        ) {
            PhaseAction::None => {},
            PhaseAction::HoldZero => desired = 0.0,
            PhaseAction::Switch(phases) => {
                if let Err(e) = self
                    .writer
                    .write_phases(
                        &mut self.bus,
                        self.config.modbus.station_slave_id,
                        &self.config.registers,
                        phases,
                    )
                    .await
                {
                    warn!("Phase write failed: {e}");
                } else {
                    self.state.applied_phases = phases;
                }
            },
        }

        // Apply the setpoint (tolerance / watchdog gated) and verify
        match self
            .writer
            .apply(
                &mut self.bus,
                self.config.modbus.station_slave_id,
                &self.config.registers,
                &self.config.controls,
                desired,
                now,
            )
            .await
        {
            Ok(_) => {
                self.state.applied_current = desired;
            },
            Err(e @ DriverError::Verification { .. }) => {
                // Transient: the watchdog forces another attempt next tick
                warn!("{e}");
            },
            Err(e) => warn!("Setpoint write failed: {e}"),
        }

        // Status transition bookkeeping
        let previous = self.state.status;
        if status != previous {
            info!("Status changed from {} to {}", previous, status);
            self.state.status = status;
        }

        let persist_due = status != previous
            || event != SessionEvent::None
            || self.flush_due(now);
        if persist_due {
            self.persist(now);
        }

        self.publish(&snapshot, status, desired, wall_now).await;
        Ok(())
    }

    /// Periodic state flush while a session is open
    fn flush_due(&self, now: Instant) -> bool {
        if self.sessions.current().is_none() {
            return false;
        }
        match self.last_flush {
            None => true,
            Some(at) => {
                now.duration_since(at)
                    >= Duration::from_secs(self.config.persistence.flush_interval_secs)
            },
        }
    }

    fn persist(&mut self, now: Instant) {
        self.state.session = self.sessions.current().cloned();
        if let Err(e) = self.store.save(&self.state) {
            warn!("State persist failed: {e}");
        } else {
            self.last_flush = Some(now);
        }
    }

    async fn refresh_prices(&mut self) {
        if let Some(feed) = self.feed.as_mut() {
            match feed.prices().await {
                Ok(points) => self.prices = points,
                Err(e) => warn!("Price feed unavailable: {e}"),
            }
        }
    }

    /// Current to request from the active schedule or price window
    fn window_current(&self, now: DateTime<Utc>) -> Option<f64> {
        if self.state.mode != ChargeMode::Scheduled {
            // AUTO/MANUAL ignore windows, but status policy still wants to
            // know whether "a window is active"; treat as active
            return Some(self.state.set_current);
        }

        if let Some(strategy) = self.strategy {
            match charge_now(now, &self.prices, strategy) {
                Some(true) => return Some(self.config.pricing.charge_current),
                Some(false) => return None,
                // No price for this hour: fall through to the time windows
                None => {},
            }
        }

        active_item(&self.schedule, now, self.config.timezone()).map(|item| item.current_a)
    }

    /// Degrade on transport failure: hold the last status until the stale
    /// threshold, then report disconnected; back off reconnects so an
    /// offline charger is not hammered.
    async fn handle_read_failure(&mut self, error: DriverError, now: Instant) {
        self.consecutive_failures += 1;
        error!(
            "Poll failed ({} consecutive): {error}",
            self.consecutive_failures
        );
        self.bus.disconnect();

        let exponent = self.consecutive_failures.saturating_sub(1).min(6);
        let cooldown = Duration::from_millis(self.config.poll.active_interval_ms)
            .saturating_mul(1 << exponent)
            .min(RECONNECT_COOLDOWN_CAP);
        self.cooldown_until = Some(now + cooldown);

        let stale_for = self
            .last_good_read
            .map(|at| now.duration_since(at))
            .unwrap_or(Duration::MAX);
        if stale_for > Duration::from_secs(self.config.controls.stale_threshold_secs)
            && self.state.status != EvChargerStatus::Disconnected
        {
            warn!(
                "Charger unreachable for {:.0} s, reporting disconnected",
                stale_for.as_secs_f64()
            );
            self.sessions.update(false, 0.0, Utc::now());
            self.state.status = EvChargerStatus::Disconnected;
            self.persist(now);
            self.publish_offline().await;
        }
    }

    /// User command handling; effects are visible on the next tick at the
    /// latest
    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetMode(mode) => {
                info!("Mode changed to {}", mode);
                self.state.mode = mode;
            },
            Command::SetStartStop(enabled) => {
                self.state.start_stop = StartStop::from_bool(enabled);
                info!("StartStop changed to {}", self.state.start_stop.code());
            },
            Command::SetCurrent(amps) => {
                let ceiling = current_ceiling(&self.config.controls, self.station_max);
                let clamped = amps.clamp(0.0, ceiling);
                if (clamped - amps).abs() > f64::EPSILON {
                    info!(
                        "Requested {:.1} A clamped to {:.1} A (station max {:.1} A)",
                        amps, clamped, self.station_max
                    );
                } else {
                    info!("Set current changed to {:.1} A", clamped);
                }
                self.state.set_current = clamped;
            },
        }
        self.persist(Instant::now());
    }

    /// Publish the full object tree and the chart point for this tick
    async fn publish(
        &mut self,
        snapshot: &RegisterSnapshot,
        status: EvChargerStatus,
        desired: f64,
        wall_now: DateTime<Utc>,
    ) {
        let session_energy = self.sessions.published_energy_wh();
        let charging_time = self.sessions.published_charging_time_secs(wall_now);

        let report = StatusReport {
            connected: true,
            status,
            status_code: status.code(),
            mode: self.state.mode.code(),
            start_stop: self.state.start_stop.code(),
            set_current: self.state.set_current,
            max_current: self.station_max,
            applied_current: snapshot.applied_current_a,
            desired_current: desired,
            phases: snapshot.phase_count,
            setpoint_valid_secs: snapshot.setpoint_valid_secs,
            voltages: snapshot.voltages,
            currents: snapshot.currents,
            power_w: snapshot.power_w,
            session_energy_wh: session_energy,
            charging_time_secs: charging_time,
            session_cost: self.sessions.current().and_then(|s| s.cost),
            lifetime_energy_wh: snapshot.energy_wh,
            product_name: self.identity.display_name(),
            firmware_version: self.identity.firmware_version.clone(),
            serial: self.identity.serial_number.clone(),
            phase_coercions: self.phase_coercions,
            updated_at: Some(wall_now),
        };

        let mut values: Vec<(Cow<'static, str>, BusValue)> = vec![
            (paths::MODE.into(), report.mode.into()),
            (paths::START_STOP.into(), report.start_stop.into()),
            (paths::SET_CURRENT.into(), report.set_current.into()),
            (paths::MAX_CURRENT.into(), report.max_current.into()),
            (paths::STATUS.into(), report.status_code.into()),
            (paths::AC_CURRENT.into(), snapshot.max_current_a().into()),
            (paths::AC_POWER.into(), report.power_w.into()),
            (
                paths::AC_ENERGY_FORWARD.into(),
                (session_energy / 1000.0).into(),
            ),
            (paths::CHARGING_TIME.into(), charging_time.into()),
        ];
        for phase in 0..3 {
            values.push((
                Cow::Owned(paths::phase(phase, "Voltage")),
                snapshot.voltages[phase].into(),
            ));
            values.push((
                Cow::Owned(paths::phase(phase, "Current")),
                snapshot.currents[phase].into(),
            ));
            values.push((
                Cow::Owned(paths::phase(phase, "Power")),
                snapshot.phase_power_w(phase).into(),
            ));
        }
        self.publisher.publish(values).await;

        self.chart.write().await.push(ChartPoint {
            ts: wall_now,
            power_w: snapshot.power_w,
            setpoint_a: desired,
            status: status.code(),
        });

        self.status_tx.send_replace(report);
    }

    /// Publish the degraded report used while the charger is unreachable
    async fn publish_offline(&mut self) {
        let mut report = self.status_tx.borrow().clone();
        report.connected = false;
        report.status = EvChargerStatus::Disconnected;
        report.status_code = EvChargerStatus::Disconnected.code();
        report.power_w = 0.0;
        report.currents = [0.0; 3];
        report.updated_at = Some(Utc::now());

        self.publisher
            .publish(vec![(
                paths::STATUS.into(),
                BusValue::from(report.status_code),
            )])
            .await;
        self.status_tx.send_replace(report);
    }

    /// Graceful shutdown: finish within the deadline, park the charger at
    /// 0 A when configured, close the session and flush state.
    async fn shutdown_sequence(&mut self) {
        info!("Shutting down engine");
        let work = async {
            if self.config.controls.safe_current_on_exit {
                let payload = encode_f32(0.0);
                if let Err(e) = self
                    .bus
                    .write_multiple(
                        self.config.modbus.station_slave_id,
                        self.config.registers.amps_config,
                        &payload,
                    )
                    .await
                {
                    warn!("Could not park charger at 0 A: {e}");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, work).await.is_err() {
            warn!("Shutdown deadline exceeded, skipping safe-current write");
        }

        if self.sessions.current().is_some() {
            self.sessions.update(false, 0.0, Utc::now());
        }
        self.state.status = EvChargerStatus::Disconnected;
        self.persist(Instant::now());
        self.bus.disconnect();
        info!("Engine stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LogBus;
    use crate::port::fake::FakeCharger;

    const SOCKET: u8 = 1;
    const STATION: u8 = 200;

    fn test_config(dir: &tempfile::TempDir) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.modbus.host = "127.0.0.1".into();
        config.persistence.state_file = dir
            .path()
            .join("state.json")
            .to_string_lossy()
            .into_owned();
        config.controls.verify_delay_ms = 0;
        config
    }

    fn plugged_out_charger() -> FakeCharger {
        let mut charger = FakeCharger::new();
        charger.set_string(STATION, station::MODE3_STATE, 5, "A");
        charger.set_u16(STATION, station::PHASES, 3);
        charger.set_f32(STATION, station::MAX_CURRENT, 32.0);
        charger.set_f64(SOCKET, socket::ENERGY_FORWARD, 1000.0);
        for i in 0..3 {
            charger.set_f32(SOCKET, socket::VOLTAGES + i * 2, 230.0);
        }
        charger
    }

    fn build_engine(
        config: DriverConfig,
        charger: FakeCharger,
    ) -> (Engine<FakeCharger>, EngineHandle) {
        let (_, readings_rx) = watch::channel(SystemReadings::default());
        let (engine, handle, _) = Engine::new(
            config,
            charger,
            Arc::new(LogBus),
            readings_rx,
            CancellationToken::new(),
        )
        .unwrap();
        (engine, handle)
    }

    #[tokio::test]
    async fn test_cold_start_plugged_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.defaults.intended_set_current = 16.0;
        let charger = plugged_out_charger();

        let (mut engine, handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Manual;
        engine.state.start_stop = StartStop::Enabled;
        engine.state.set_current = 16.0;
        // A previous run already confirmed 16 A
        engine.writer.seed(16.0, Instant::now());

        for _ in 0..3 {
            engine.tick().await;
        }

        let report = handle.report();
        assert_eq!(report.status, EvChargerStatus::Disconnected);
        assert_eq!(report.status_code, 0);
        // The setpoint did not change and the watchdog has not expired
        assert_eq!(engine.bus.writes_to(STATION, 1210), 0);
    }

    #[tokio::test]
    async fn test_plug_in_to_charge_transition() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let charger = plugged_out_charger();

        let (mut engine, handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Manual;
        engine.state.start_stop = StartStop::Enabled;
        engine.state.set_current = 10.0;

        let mut seen = Vec::new();
        for raw in ["A", "B1", "B2", "C2"] {
            engine.bus.set_string(STATION, station::MODE3_STATE, 5, raw);
            engine.tick().await;
            seen.push(handle.report().status);
        }

        assert_eq!(
            seen,
            vec![
                EvChargerStatus::Disconnected,
                EvChargerStatus::Connected,
                EvChargerStatus::Connected,
                EvChargerStatus::Charging,
            ]
        );

        // A session opened at the B1 tick with the counter as start energy
        let session = engine.sessions.current().unwrap();
        assert!((session.start_energy_wh - 1000.0).abs() < 1e-6);

        // The 10 A setpoint reached the charger and verified
        assert!((engine.bus.get_f32(STATION, 1210) - 10.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_session_survives_counter_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let mut charger = plugged_out_charger();
        charger.set_string(STATION, station::MODE3_STATE, 5, "C2");

        let (mut engine, _handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Manual;
        engine.state.start_stop = StartStop::Enabled;
        engine.state.set_current = 10.0;

        engine.tick().await;
        engine.bus.set_f64(SOCKET, socket::ENERGY_FORWARD, 1500.0);
        engine.tick().await;
        assert!((engine.sessions.current().unwrap().energy_wh - 500.0).abs() < 1e-6);

        // Charger reboot: counter restarts at 200 Wh
        engine.bus.set_f64(SOCKET, socket::ENERGY_FORWARD, 200.0);
        engine.tick().await;
        let session = engine.sessions.current().unwrap();
        assert!((session.energy_wh - 500.0).abs() < 1e-6);
        assert!((session.carried_wh - 500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_scheduled_mode_without_window_writes_zero() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let mut charger = plugged_out_charger();
        charger.set_string(STATION, station::MODE3_STATE, 5, "B2");

        let (mut engine, handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Scheduled;
        engine.state.start_stop = StartStop::Enabled;

        engine.tick().await;

        let report = handle.report();
        assert_eq!(report.status, EvChargerStatus::WaitStart);
        assert_eq!(report.desired_current, 0.0);
        assert!((engine.bus.get_f32(STATION, 1210)).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_stale_degrades_to_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        config.controls.stale_threshold_secs = 0;
        let mut charger = plugged_out_charger();
        charger.set_string(STATION, station::MODE3_STATE, 5, "C2");

        let (mut engine, handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Manual;
        engine.state.start_stop = StartStop::Enabled;
        engine.state.set_current = 10.0;

        engine.tick().await;
        assert_eq!(handle.report().status, EvChargerStatus::Charging);
        assert!(engine.sessions.current().is_some());

        // Transport dies; the zero stale threshold degrades immediately
        engine.bus.fail_reads = true;
        engine.cooldown_until = None;
        engine.tick().await;

        let report = handle.report();
        assert!(!report.connected);
        assert_eq!(report.status, EvChargerStatus::Disconnected);
        assert!(engine.sessions.current().is_none());
        assert!(engine.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn test_commands_are_applied_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let state_file = config.persistence.state_file.clone();
        let charger = plugged_out_charger();

        let (mut engine, _handle) = build_engine(config, charger);
        engine.station_max = 32.0;

        engine.handle_command(Command::SetMode(ChargeMode::Auto)).await;
        engine.handle_command(Command::SetStartStop(true)).await;
        // 40 A exceeds min(station 32, configured 32)
        engine.handle_command(Command::SetCurrent(40.0)).await;

        assert_eq!(engine.state.mode, ChargeMode::Auto);
        assert!(engine.state.start_stop.is_enabled());
        assert!((engine.state.set_current - 32.0).abs() < 1e-9);

        let persisted = StateStore::new(&state_file).load();
        assert_eq!(persisted.mode, ChargeMode::Auto);
        assert!((persisted.set_current - 32.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_auto_mode_waits_for_sun_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let mut charger = plugged_out_charger();
        charger.set_string(STATION, station::MODE3_STATE, 5, "B2");

        let (readings_tx, readings_rx) = watch::channel(SystemReadings {
            pv_power_w: 5000.0,
            house_load_w: 2000.0,
            battery_power_w: 0.0,
            battery_soc: None,
        });
        let (mut engine, handle, _) = Engine::new(
            config,
            charger,
            Arc::new(LogBus),
            readings_rx,
            CancellationToken::new(),
        )
        .unwrap();
        engine.state.mode = ChargeMode::Auto;
        engine.state.start_stop = StartStop::Enabled;

        // 3 kW excess on three phases is under the 6 A enable minimum
        engine.tick().await;
        assert_eq!(handle.report().status, EvChargerStatus::WaitSun);
        assert_eq!(handle.report().desired_current, 0.0);

        // 7 kW excess clears the threshold; status leaves WaitSun while the
        // enable hold still keeps the applied current at zero
        readings_tx
            .send(SystemReadings {
                pv_power_w: 8000.0,
                house_load_w: 1000.0,
                battery_power_w: 0.0,
                battery_soc: None,
            })
            .unwrap();
        engine.tick().await;
        assert_eq!(handle.report().status, EvChargerStatus::Connected);
        assert_eq!(handle.report().desired_current, 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_parks_charger_and_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let state_file = config.persistence.state_file.clone();
        let mut charger = plugged_out_charger();
        charger.set_string(STATION, station::MODE3_STATE, 5, "C2");

        let (mut engine, _handle) = build_engine(config, charger);
        engine.state.mode = ChargeMode::Manual;
        engine.state.start_stop = StartStop::Enabled;
        engine.state.set_current = 10.0;

        engine.tick().await;
        assert!(engine.sessions.current().is_some());

        engine.shutdown_sequence().await;

        // Parked at 0 A
        assert!((engine.bus.get_f32(STATION, 1210)).abs() < 0.01);
        // Session closed and flushed
        assert!(engine.sessions.current().is_none());
        let persisted = StateStore::new(&state_file).load();
        assert!(persisted.session.is_none());
        assert_eq!(persisted.status, EvChargerStatus::Disconnected);
    }
}
