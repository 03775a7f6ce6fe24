use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shared_types::Purpose;

// -----------------------------------------------------------------------------
// ----- MetricsSink -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    SessionsCreated,
    SessionsFailed,
    SessionsEvicted,
    ValidationFailures,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gauge {
    Total,
    Active,
    Healthy,
}

/// Where the pool pushes its counters and gauges. Implementations must be
/// cheap; the pool calls them inline.
pub trait MetricsSink: Send + Sync + 'static {
    fn incr(&self, counter: Counter, purpose: Purpose);
    fn gauge(&self, gauge: Gauge, purpose: Purpose, value: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _counter: Counter, _purpose: Purpose) {}
    fn gauge(&self, _gauge: Gauge, _purpose: Purpose, _value: u64) {}
}

// -----------------------------------------------------------------------------
// ----- PoolMetrics -----------------------------------------------------------

/// In-process sink: totals as atomics, gauges per purpose.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    created: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
    validation_failures: AtomicU64,
    gauges: Mutex<BTreeMap<Purpose, GaugeValues>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GaugeValues {
    pub total: u64,
    pub active: u64,
    pub healthy: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub failed: u64,
    pub evicted: u64,
    pub validation_failures: u64,
    pub gauges: BTreeMap<Purpose, GaugeValues>,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            gauges: self.gauges.lock().clone(),
        }
    }
}

impl MetricsSink for PoolMetrics {
    fn incr(&self, counter: Counter, _purpose: Purpose) {
        let slot = match counter {
            Counter::SessionsCreated => &self.created,
            Counter::SessionsFailed => &self.failed,
            Counter::SessionsEvicted => &self.evicted,
            Counter::ValidationFailures => &self.validation_failures,
        };
        slot.fetch_add(1, Ordering::Relaxed);
    }

    fn gauge(&self, gauge: Gauge, purpose: Purpose, value: u64) {
        let mut gauges = self.gauges.lock();
        let values = gauges.entry(purpose).or_default();
        match gauge {
            Gauge::Total => values.total = value,
            Gauge::Active => values.active = value,
            Gauge::Healthy => values.healthy = value,
        }
    }
}
