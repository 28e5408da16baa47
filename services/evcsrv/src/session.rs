//! Charging session tracking
//!
//! A session opens when the canonical status first leaves `Disconnected`
//! and closes when it returns. Energy is accounted from the charger's
//! lifetime counter; a counter that moves backwards (charger reboot) rebases
//! the session rather than losing the accumulated delta.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A single charging session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChargingSession {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifetime counter value at session start (Wh)
    pub start_energy_wh: f64,
    /// Energy accumulated before the last counter rebase (Wh)
    pub carried_wh: f64,
    /// Live session energy (Wh), non-decreasing
    pub energy_wh: f64,
    /// Accumulated cost while a price feed is active
    pub cost: Option<f64>,
}

impl ChargingSession {
    fn open(started_at: DateTime<Utc>, start_energy_wh: f64) -> Self {
        Self {
            started_at,
            ended_at: None,
            start_energy_wh,
            carried_wh: 0.0,
            energy_wh: 0.0,
            cost: None,
        }
    }

    /// Session duration; runs until `now` while the session is open
    pub fn charging_time_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        (end - self.started_at).num_seconds().max(0)
    }
}

/// What the tracker did with the latest reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    None,
    Opened,
    Closed,
    /// The lifetime counter moved backwards; start energy was rebased
    Rebased,
}

/// Tracks the at-most-one open session and the last finished one
#[derive(Debug, Default)]
pub struct SessionTracker {
    current: Option<ChargingSession>,
    last: Option<ChargingSession>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ChargingSession> {
        self.current.as_ref()
    }

    pub fn last(&self) -> Option<&ChargingSession> {
        self.last.as_ref()
    }

    /// Session energy to publish: the open session's if any, else the last one's
    pub fn published_energy_wh(&self) -> f64 {
        self.current
            .as_ref()
            .or(self.last.as_ref())
            .map(|s| s.energy_wh)
            .unwrap_or(0.0)
    }

    /// Charging time to publish, mirroring `published_energy_wh`
    pub fn published_charging_time_secs(&self, now: DateTime<Utc>) -> i64 {
        self.current
            .as_ref()
            .or(self.last.as_ref())
            .map(|s| s.charging_time_secs(now))
            .unwrap_or(0)
    }

    /// Feed one tick.
    ///
    /// `plugged` is whether the canonical status is anything other than
    /// `Disconnected`; `energy_wh` is the charger's lifetime counter.
    pub fn update(&mut self, plugged: bool, energy_wh: f64, now: DateTime<Utc>) -> SessionEvent {
        if plugged {
            let Some(session) = self.current.as_mut() else {
                info!("Charging session started (counter at {:.1} Wh)", energy_wh);
                self.current = Some(ChargingSession::open(now, energy_wh));
                return SessionEvent::Opened;
            };

            if energy_wh < session.start_energy_wh {
                // Counter went backwards: charger reboot or rollover
                warn!(
                    "Energy counter dropped from {:.1} to {:.1} Wh, rebasing session",
                    session.start_energy_wh, energy_wh
                );
                session.carried_wh = session.energy_wh;
                session.start_energy_wh = energy_wh;
                SessionEvent::Rebased
            } else {
                session.energy_wh =
                    session.carried_wh + (energy_wh - session.start_energy_wh).max(0.0);
                SessionEvent::None
            }
        } else if let Some(mut session) = self.current.take() {
            session.ended_at = Some(now);
            info!(
                "Charging session finished: {:.1} Wh in {} s",
                session.energy_wh,
                session.charging_time_secs(now)
            );
            self.last = Some(session);
            SessionEvent::Closed
        } else {
            SessionEvent::None
        }
    }

    /// Accumulate cost for the current tick while a price feed is active.
    ///
    /// `price_per_kwh` is the price effective at the current wall-clock hour.
    pub fn accumulate_cost(&mut self, power_w: f64, tick_secs: f64, price_per_kwh: f64) {
        if let Some(session) = self.current.as_mut() {
            let increment = (power_w / 1000.0) / 3600.0 * tick_secs * price_per_kwh;
            *session.cost.get_or_insert(0.0) += increment.max(0.0);
        }
    }

    /// Try to resume a persisted session at startup.
    ///
    /// Accepted only when the charger still reports a plugged state and the
    /// session started less than `max_age_hours` ago; stale sessions are
    /// discarded.
    pub fn restore(
        &mut self,
        session: ChargingSession,
        plugged: bool,
        now: DateTime<Utc>,
        max_age_hours: i64,
    ) -> bool {
        let age_ok = now - session.started_at < ChronoDuration::hours(max_age_hours);
        if plugged && session.ended_at.is_none() && age_ok {
            info!(
                "Resuming charging session from {} ({:.1} Wh so far)",
                session.started_at, session.energy_wh
            );
            self.current = Some(session);
            true
        } else {
            if session.ended_at.is_none() {
                info!("Discarding stale persisted session from {}", session.started_at);
            }
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
