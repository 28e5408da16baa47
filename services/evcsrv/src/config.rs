//! Service configuration
//!
//! YAML configuration loaded once at startup and treated as immutable for
//! the rest of the run. Every section is a closed schema: unknown keys are
//! rejected at parse time, and `validate()` checks ranges and relationships,
//! reporting structured errors with field paths (e.g. `modbus.host`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::schedule::parse_hhmm;
use crate::error::{DriverError, Result};

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DriverConfig {
    pub modbus: ModbusConfig,
    pub registers: RegisterOverrides,
    pub defaults: DefaultsConfig,
    pub controls: ControlsConfig,
    pub poll: PollConfig,
    pub schedule: Vec<ScheduleItemConfig>,
    pub pricing: PricingConfig,
    pub persistence: PersistenceConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    /// IANA timezone used for schedule evaluation
    pub timezone: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            registers: RegisterOverrides::default(),
            defaults: DefaultsConfig::default(),
            controls: ControlsConfig::default(),
            poll: PollConfig::default(),
            schedule: Vec::new(),
            pricing: PricingConfig::default(),
            persistence: PersistenceConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Modbus TCP connection parameters.
///
/// The charger exposes two slave IDs: socket measurements (typically 1) and
/// station control (typically 200).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ModbusConfig {
    pub host: String,
    pub port: u16,
    pub socket_slave_id: u8,
    pub station_slave_id: u8,
    pub connect_timeout_secs: u64,
    pub op_timeout_secs: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 502,
            socket_slave_id: 1,
            station_slave_id: 200,
            connect_timeout_secs: 5,
            op_timeout_secs: 3,
        }
    }
}

/// Writable register addresses that vary between charger firmware revisions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RegisterOverrides {
    /// Modbus-set max current register (f32, R/W)
    pub amps_config: u16,
    /// Phase count register (u16, R/W)
    pub phases: u16,
}

impl Default for RegisterOverrides {
    fn default() -> Self {
        Self {
            amps_config: 1210,
            phases: 1215,
        }
    }
}

/// Default operating values used until the charger or the user says otherwise
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultsConfig {
    pub mode: u8,
    pub start_stop: bool,
    pub intended_set_current: f64,
    /// Fallback when register 1100 cannot be read
    pub station_max_current: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            mode: 0,
            start_stop: false,
            intended_set_current: 6.0,
            station_max_current: 32.0,
        }
    }
}

/// Current-setting behaviour: clamps, watchdog, verification, hysteresis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ControlsConfig {
    /// Hard upper limit applied on top of the station maximum
    pub max_set_current: f64,
    /// Minimum enable current; desired values below this are written as 0
    pub min_current: f64,
    /// Write when |desired - last written| exceeds this
    pub current_tolerance: f64,
    /// Watchdog: maximum seconds between setpoint writes
    pub current_update_interval_secs: u64,
    /// Delay before the verifying read-back
    pub verify_delay_ms: u64,
    /// Verification retries per write
    pub max_retries: u32,
    /// AUTO: excess current to begin charging
    pub enable_threshold: f64,
    /// AUTO: seconds of sustained excess before starting
    pub enable_hold_secs: u64,
    /// AUTO: seconds of sustained deficit before stopping
    pub disable_hold_secs: u64,
    /// AUTO: battery state of charge below which charging pauses
    pub min_battery_soc: f64,
    /// Above this the charger is asked for three phases
    pub single_phase_max: f64,
    /// Dead-band below single_phase_max before switching back to one phase
    pub phase_hysteresis: f64,
    /// Minimum seconds between phase-count writes
    pub phase_switch_interval_secs: u64,
    /// Seconds at 0 A before a phase switch while charging
    pub phase_drain_secs: u64,
    /// Real power below this counts as not charging
    pub charged_power_threshold_w: f64,
    /// Seconds under the threshold before reporting Charged
    pub charged_hold_secs: u64,
    /// Seconds to hold the last status over transport failures
    pub stale_threshold_secs: u64,
    /// Write 0 A to the charger on shutdown
    pub safe_current_on_exit: bool,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            max_set_current: 32.0,
            min_current: 6.0,
            current_tolerance: 0.5,
            current_update_interval_secs: 30,
            verify_delay_ms: 100,
            max_retries: 3,
            enable_threshold: 6.0,
            enable_hold_secs: 30,
            disable_hold_secs: 60,
            min_battery_soc: 0.0,
            single_phase_max: 16.0,
            phase_hysteresis: 2.0,
            phase_switch_interval_secs: 60,
            phase_drain_secs: 5,
            charged_power_threshold_w: 100.0,
            charged_hold_secs: 30,
            stale_threshold_secs: 15,
            safe_current_on_exit: true,
        }
    }
}

impl ControlsConfig {
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.current_update_interval_secs)
    }
}

/// Polling cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct PollConfig {
    /// Tick interval while charging or connected
    pub active_interval_ms: u64,
    /// Tick interval while disconnected
    pub idle_interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            active_interval_ms: 1000,
            idle_interval_ms: 5000,
        }
    }
}

/// One schedule window as written in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ScheduleItemConfig {
    pub active: bool,
    /// Days of week, 0 = Monday .. 6 = Sunday
    pub days: Vec<u8>,
    /// Window start, "HH:MM"
    pub start: String,
    /// Window end, "HH:MM"; wraps past midnight when end <= start
    pub end: String,
    pub current_a: f64,
}

impl Default for ScheduleItemConfig {
    fn default() -> Self {
        Self {
            active: false,
            days: Vec::new(),
            start: "00:00".to_string(),
            end: "00:00".to_string(),
            current_a: 6.0,
        }
    }
}

/// Dynamic price feed configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct PricingConfig {
    pub enabled: bool,
    /// Endpoint returning a JSON array of hourly price points
    pub url: String,
    /// Optional bearer token
    pub token: String,
    /// "level", "threshold" or "percentile"
    pub strategy: String,
    /// level: charge while price <= this absolute value
    pub max_price: f64,
    /// threshold: charge while price <= cheapest * (1 + tolerance)
    pub tolerance: f64,
    /// percentile: charge during the cheapest fraction of the horizon (0..1)
    pub percentile: f64,
    /// Current to request inside a chosen hour
    pub charge_current: f64,
    pub cache_ttl_secs: u64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: String::new(),
            strategy: "threshold".to_string(),
            max_price: 0.20,
            tolerance: 0.10,
            percentile: 0.25,
            charge_current: 16.0,
            cache_ttl_secs: 900,
        }
    }
}

/// State-file location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct PersistenceConfig {
    pub state_file: String,
    /// Maximum seconds between state flushes while a session is open
    pub flush_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: "/data/evcsrv_state.json".to_string(),
            flush_interval_secs: 30,
        }
    }
}

/// Local management API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    /// Chart ring capacity (points)
    pub chart_points: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8088".to_string(),
            chart_points: 720,
        }
    }
}

/// Logging behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DriverError::config("config", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(raw)
            .map_err(|e| DriverError::config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges and relationships; errors carry the offending field path
    pub fn validate(&self) -> Result<()> {
        if self.modbus.host.is_empty() {
            return Err(DriverError::config("modbus.host", "must not be empty"));
        }
        if self.modbus.port == 0 {
            return Err(DriverError::config("modbus.port", "must be non-zero"));
        }
        if self.modbus.socket_slave_id == self.modbus.station_slave_id {
            return Err(DriverError::config(
                "modbus.station_slave_id",
                "must differ from socket_slave_id",
            ));
        }

        if self.controls.min_current <= 0.0 {
            return Err(DriverError::config(
                "controls.min_current",
                "must be positive",
            ));
        }
        if self.controls.max_set_current < self.controls.min_current {
            return Err(DriverError::config(
                "controls.max_set_current",
                "must be at least controls.min_current",
            ));
        }
        if self.controls.current_tolerance <= 0.0 {
            return Err(DriverError::config(
                "controls.current_tolerance",
                "must be positive",
            ));
        }
        if !(0.0..=100.0).contains(&self.controls.min_battery_soc) {
            return Err(DriverError::config(
                "controls.min_battery_soc",
                "must be within 0..=100",
            ));
        }
        if self.controls.phase_hysteresis >= self.controls.single_phase_max {
            return Err(DriverError::config(
                "controls.phase_hysteresis",
                "must be below single_phase_max",
            ));
        }

        if self.poll.active_interval_ms == 0 || self.poll.idle_interval_ms == 0 {
            return Err(DriverError::config(
                "poll.active_interval_ms",
                "intervals must be non-zero",
            ));
        }

        for (idx, item) in self.schedule.iter().enumerate() {
            let field = |name: &str| format!("schedule[{idx}].{name}");
            for &day in &item.days {
                if day > 6 {
                    return Err(DriverError::config(
                        field("days"),
                        format!("invalid day {day}, expected 0..=6 (0 = Monday)"),
                    ));
                }
            }
            parse_hhmm(&item.start)
                .ok_or_else(|| DriverError::config(field("start"), "expected HH:MM"))?;
            parse_hhmm(&item.end)
                .ok_or_else(|| DriverError::config(field("end"), "expected HH:MM"))?;
            if item.current_a < 0.0 {
                return Err(DriverError::config(
                    field("current_a"),
                    "must be non-negative",
                ));
            }
        }

        if self.pricing.enabled {
            if self.pricing.url.is_empty() {
                return Err(DriverError::config("pricing.url", "must not be empty"));
            }
            match self.pricing.strategy.as_str() {
                "level" | "threshold" | "percentile" => {},
                other => {
                    return Err(DriverError::config(
                        "pricing.strategy",
                        format!("unknown strategy '{other}', expected level|threshold|percentile"),
                    ));
                },
            }
            if !(0.0..=1.0).contains(&self.pricing.percentile) {
                return Err(DriverError::config(
                    "pricing.percentile",
                    "must be within 0..=1",
                ));
            }
            if self.pricing.tolerance < 0.0 {
                return Err(DriverError::config(
                    "pricing.tolerance",
                    "must be non-negative",
                ));
            }
        }

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(DriverError::config(
                "timezone",
                format!("unknown timezone '{}'", self.timezone),
            ));
        }

        if self.defaults.mode > 2 {
            return Err(DriverError::config(
                "defaults.mode",
                "expected 0 (manual), 1 (auto) or 2 (scheduled)",
            ));
        }

        if self.api.enabled && self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(DriverError::config(
                "api.bind_address",
                format!("invalid socket address '{}'", self.api.bind_address),
            ));
        }

        Ok(())
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        // Validated at load time
        self.timezone.parse().unwrap_or(chrono_tz::Tz::UTC)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "modbus:\n  host: 192.168.1.40\n";

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = DriverConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.modbus.host, "192.168.1.40");
        assert_eq!(config.modbus.port, 502);
        assert_eq!(config.modbus.station_slave_id, 200);
        assert_eq!(config.controls.current_tolerance, 0.5);
        assert_eq!(config.poll.active_interval_ms, 1000);
        assert_eq!(config.timezone, "UTC");
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let err = DriverConfig::from_yaml("{}").unwrap_err();
        assert!(err.to_string().contains("modbus.host"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let raw = "modbus:\n  host: 10.0.0.1\n  flux_capacitor: 1\n";
        assert!(DriverConfig::from_yaml(raw).is_err());
    }

    #[test]
    fn test_schedule_validation_reports_field_path() {
        let raw = "modbus:\n  host: 10.0.0.1\nschedule:\n  - active: true\n    days: [9]\n    start: \"23:00\"\n    end: \"07:00\"\n    current_a: 16\n";
        let err = DriverConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("schedule[0].days"));
    }

    #[test]
    fn test_bad_time_format_is_rejected() {
        let raw = "modbus:\n  host: 10.0.0.1\nschedule:\n  - active: true\n    days: [0]\n    start: \"25:00\"\n    end: \"07:00\"\n    current_a: 16\n";
        let err = DriverConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("schedule[0].start"));
    }

    #[test]
    fn test_bad_timezone_is_rejected() {
        let raw = "modbus:\n  host: 10.0.0.1\ntimezone: Mars/Olympus\n";
        let err = DriverConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("timezone"));
    }

    #[test]
    fn test_pricing_strategy_is_checked_when_enabled() {
        let raw = "modbus:\n  host: 10.0.0.1\npricing:\n  enabled: true\n  url: http://prices.local/today\n  strategy: cheapest\n";
        let err = DriverConfig::from_yaml(raw).unwrap_err();
        assert!(err.to_string().contains("pricing.strategy"));
    }

    #[test]
    fn test_yaml_roundtrip_is_semantically_stable() {
        let config = DriverConfig::from_yaml(MINIMAL).unwrap();
        let dumped = serde_yaml::to_string(&config).unwrap();
        let reloaded = DriverConfig::from_yaml(&dumped).unwrap();
        assert_eq!(reloaded, config);
    }
}
