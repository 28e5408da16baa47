//! Schedule windows
//!
//! Time-of-day charging windows evaluated against the wall clock in the
//! configured timezone. Day bits are Monday-based (bit 0 = Monday); a
//! window wraps past midnight when its start lies at or after its end.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::config::ScheduleItemConfig;

/// A normalised schedule window
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleItem {
    pub active: bool,
    /// Days of week bitset, bit 0 = Monday .. bit 6 = Sunday
    pub days: u8,
    pub start_minute: u16,
    pub end_minute: u16,
    pub current_a: f64,
}

impl ScheduleItem {
    /// Build from the configuration form; invalid times were rejected by the
    /// config validator, so they fall back to an inactive item here.
    pub fn from_config(config: &ScheduleItemConfig) -> Self {
        let (start, end) = match (parse_hhmm(&config.start), parse_hhmm(&config.end)) {
            (Some(s), Some(e)) => (s, e),
            _ => (0, 0),
        };
        let mut days = 0u8;
        for &day in &config.days {
            if day <= 6 {
                days |= 1 << day;
            }
        }
        Self {
            active: config.active,
            days,
            start_minute: start,
            end_minute: end,
            current_a: config.current_a,
        }
    }

    /// Whether this window covers the given local weekday and minute.
    ///
    /// `weekday` is Monday-based (0..=6). A window with equal start and end
    /// is empty, never matched.
    pub fn matches(&self, weekday: u8, minute_of_day: u16) -> bool {
        if !self.active || self.days & (1 << weekday) == 0 {
            return false;
        }
        if self.start_minute == self.end_minute {
            return false;
        }
        if self.start_minute < self.end_minute {
            (self.start_minute..self.end_minute).contains(&minute_of_day)
        } else {
            // Overnight window
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

/// Parse "HH:MM" into minutes past midnight
pub fn parse_hhmm(value: &str) -> Option<u16> {
    let (hours, minutes) = value.split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Local weekday (Monday = 0) and minute of day at `now` in `tz`
pub fn local_clock(now: DateTime<Utc>, tz: Tz) -> (u8, u16) {
    let local = tz.from_utc_datetime(&now.naive_utc());
    let weekday = local.weekday().num_days_from_monday() as u8;
    let minute = (local.hour() * 60 + local.minute()) as u16;
    (weekday, minute)
}

/// First matching item wins
pub fn active_item<'a>(
    items: &'a [ScheduleItem],
    now: DateTime<Utc>,
    tz: Tz,
) -> Option<&'a ScheduleItem> {
    let (weekday, minute) = local_clock(now, tz);
    items.iter().find(|item| item.matches(weekday, minute))
}

// ============================================================================
// Tests
// ============================================================================
