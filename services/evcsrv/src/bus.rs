//! System-bus publication
//!
//! The driver publishes its object tree through the [`BusPublisher`] seam;
//! the real system-bus binding is an external collaborator, and [`LogBus`]
//! stands in when none is attached. The chart ring keeps a short in-memory
//! history for the UI.

use std::borrow::Cow;
use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

/// Well-known published paths
pub mod paths {
    pub const MODE: &str = "/Mode";
    pub const START_STOP: &str = "/StartStop";
    pub const SET_CURRENT: &str = "/SetCurrent";
    pub const MAX_CURRENT: &str = "/MaxCurrent";
    pub const STATUS: &str = "/Status";
    pub const AC_CURRENT: &str = "/Ac/Current";
    pub const AC_POWER: &str = "/Ac/Power";
    pub const AC_ENERGY_FORWARD: &str = "/Ac/Energy/Forward";
    pub const CHARGING_TIME: &str = "/ChargingTime";
    pub const PRODUCT_NAME: &str = "/ProductName";
    pub const FIRMWARE_VERSION: &str = "/FirmwareVersion";
    pub const SERIAL: &str = "/Serial";

    /// Per-phase path: `/Ac/L{n}/{quantity}`
    pub fn phase(n: usize, quantity: &str) -> String {
        format!("/Ac/L{}/{}", n + 1, quantity)
    }
}

/// Value published on a bus path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BusValue {
    Integer(i64),
    Float(f64),
    Text(Cow<'static, str>),
}

impl From<i64> for BusValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u8> for BusValue {
    fn from(v: u8) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for BusValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self {
        Self::Text(Cow::Owned(v))
    }
}

impl From<&'static str> for BusValue {
    fn from(v: &'static str) -> Self {
        Self::Text(Cow::Borrowed(v))
    }
}

/// Publication sink for the driver's object tree.
///
/// Implementations must tolerate being called once per tick with the full
/// value set; deduplication is the binding's concern.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, values: Vec<(Cow<'static, str>, BusValue)>);
}

/// Stub publisher: traces the values instead of putting them on a bus
#[derive(Debug, Default)]
pub struct LogBus;

#[async_trait]
impl BusPublisher for LogBus {
    async fn publish(&self, values: Vec<(Cow<'static, str>, BusValue)>) {
        for (path, value) in values {
            trace!("[publish] {} = {:?}", path, value);
        }
    }
}

/// One point on the UI chart
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChartPoint {
    pub ts: DateTime<Utc>,
    pub power_w: f64,
    pub setpoint_a: f64,
    pub status: u8,
}

/// Fixed-capacity ring of recent chart points
#[derive(Debug)]
pub struct ChartRing {
    capacity: usize,
    points: VecDeque<ChartPoint>,
}

impl ChartRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            points: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, point: ChartPoint) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn points(&self) -> Vec<ChartPoint> {
        self.points.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn point(secs: i64) -> ChartPoint {
        ChartPoint {
            ts: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            power_w: 1000.0,
            setpoint_a: 6.0,
            status: 2,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = ChartRing::new(3);
        for i in 0..5 {
            ring.push(point(i));
        }
        let points = ring.points();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], point(2));
        assert_eq!(points[2], point(4));
    }

    #[test]
    fn test_ring_capacity_floor() {
        let mut ring = ChartRing::new(0);
        ring.push(point(0));
        ring.push(point(1));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_bus_value_serializes_untagged() {
        assert_eq!(
            serde_json::to_string(&BusValue::Integer(2)).unwrap(),
            "2"
        );
        assert_eq!(
            serde_json::to_string(&BusValue::Text("B1".into())).unwrap(),
            "\"B1\""
        );
    }
}
