//! Dynamic-price charging strategy
//!
//! The evaluator is pure over `{now, prices}`: it selects the hours worth
//! charging in and reports whether the current hour is one of them. The
//! HTTP fetch lives in [`feed`] with its own retry and cache discipline, so
//! the policy stays deterministic and testable.

pub mod feed;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::Deserialize;

use crate::config::PricingConfig;
use crate::error::{DriverError, Result};

/// One hourly price point
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PricePoint {
    /// Start of the hour this price applies to
    pub starts_at: DateTime<Utc>,
    /// Price per kWh
    pub total: f64,
}

/// Window-selection strategy over the price horizon
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PriceStrategy {
    /// Charge whenever the price is at or below an absolute threshold
    Level { max_price: f64 },
    /// Charge whenever the price is within tolerance of the cheapest hour
    Threshold { tolerance: f64 },
    /// Charge during the cheapest fraction of the horizon
    Percentile { fraction: f64 },
}

impl PriceStrategy {
    pub fn from_config(config: &PricingConfig) -> Result<Self> {
        match config.strategy.as_str() {
            "level" => Ok(Self::Level {
                max_price: config.max_price,
            }),
            "threshold" => Ok(Self::Threshold {
                tolerance: config.tolerance,
            }),
            "percentile" => Ok(Self::Percentile {
                fraction: config.percentile,
            }),
            other => Err(DriverError::config(
                "pricing.strategy",
                format!("unknown strategy '{other}'"),
            )),
        }
    }
}

/// Horizon considered when ranking hours
const HORIZON_HOURS: i64 = 24;

/// Truncate to the start of the hour the instant falls in
fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(ChronoDuration::hours(1)).unwrap_or(ts)
}

/// Select the charge hours within the next 24-hour horizon.
///
/// The returned starts are the virtual schedule windows SCHEDULED mode
/// matches against; each covers one hour.
pub fn select_charge_hours(
    now: DateTime<Utc>,
    prices: &[PricePoint],
    strategy: PriceStrategy,
) -> Vec<DateTime<Utc>> {
    let window_start = hour_floor(now);
    let window_end = window_start + ChronoDuration::hours(HORIZON_HOURS);

    let mut horizon: Vec<&PricePoint> = prices
        .iter()
        .filter(|p| p.starts_at >= window_start && p.starts_at < window_end)
        .collect();
    if horizon.is_empty() {
        return Vec::new();
    }

    match strategy {
        PriceStrategy::Level { max_price } => horizon
            .iter()
            .filter(|p| p.total <= max_price)
            .map(|p| p.starts_at)
            .collect(),
        PriceStrategy::Threshold { tolerance } => {
            let cheapest = horizon
                .iter()
                .map(|p| p.total)
                .fold(f64::INFINITY, f64::min);
            let cutoff = cheapest * (1.0 + tolerance.max(0.0));
            horizon
                .iter()
                .filter(|p| p.total <= cutoff)
                .map(|p| p.starts_at)
                .collect()
        },
        PriceStrategy::Percentile { fraction } => {
            let take = ((horizon.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
            horizon.sort_by(|a, b| a.total.total_cmp(&b.total));
            horizon
                .iter()
                .take(take)
                .map(|p| p.starts_at)
                .collect()
        },
    }
}

/// Whether the current hour is a charge hour.
///
/// `None` when the feed has no price for the current hour; SCHEDULED mode
/// falls back to its configured time windows in that case.
pub fn charge_now(
    now: DateTime<Utc>,
    prices: &[PricePoint],
    strategy: PriceStrategy,
) -> Option<bool> {
    let this_hour = hour_floor(now);
    prices.iter().find(|p| p.starts_at == this_hour)?;
    Some(select_charge_hours(now, prices, strategy).contains(&this_hour))
}

/// Price effective at `now`, used for session cost accounting
pub fn price_at(now: DateTime<Utc>, prices: &[PricePoint]) -> Option<f64> {
    let this_hour = hour_floor(now);
    prices
        .iter()
        .find(|p| p.starts_at == this_hour)
        .map(|p| p.total)
}

// ============================================================================
// Tests
// ============================================================================
