//! Process metrics for the shard distribution service.
//!
//! Plain atomics; export to a metrics backend is the embedder's concern.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge for values that go up and down.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics registry for a distributor process.
#[derive(Debug, Default)]
pub struct DistributorMetrics {
    /// Heartbeats recorded.
    pub heartbeats_recorded: Counter,
    /// Ownership lookups served.
    pub owner_lookups: Counter,
    /// Ephemeral shards assigned.
    pub ephemeral_assignments: Counter,
    /// Assignment transactions committed by the reconciler.
    pub assignments_committed: Counter,
    /// Assignment transactions rejected with a version conflict.
    pub assignment_conflicts: Counter,
    /// Executors expired and deleted.
    pub executors_expired: Counter,
    /// Namespaces currently led by this process.
    pub namespaces_led: Gauge,
}

impl DistributorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeats_recorded: self.heartbeats_recorded.get(),
            owner_lookups: self.owner_lookups.get(),
            ephemeral_assignments: self.ephemeral_assignments.get(),
            assignments_committed: self.assignments_committed.get(),
            assignment_conflicts: self.assignment_conflicts.get(),
            executors_expired: self.executors_expired.get(),
            namespaces_led: self.namespaces_led.get(),
        }
    }
}

/// Point-in-time view of [`DistributorMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub heartbeats_recorded: u64,
    pub owner_lookups: u64,
    pub ephemeral_assignments: u64,
    pub assignments_committed: u64,
    pub assignment_conflicts: u64,
    pub executors_expired: u64,
    pub namespaces_led: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new();
        gauge.set(3);
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = DistributorMetrics::new();
        metrics.heartbeats_recorded.inc();
        metrics.namespaces_led.set(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.heartbeats_recorded, 1);
        assert_eq!(snapshot.namespaces_led, 2);
        assert_eq!(snapshot.assignment_conflicts, 0);
    }
}
