//! Stats snapshots and the cross-restart merge rule.
//!
//! Metrics must be continuous across a restart: the new instance starts
//! from zero and folds in the old instance's final snapshot. Counters are
//! summed; gauges take whichever side observed the metric more recently.
//!
//! Each snapshot carries a unique id and the importer remembers which
//! snapshots it has applied, so delivering the same snapshot twice (e.g.
//! a retried stats exchange) cannot double-count.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single metric value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    /// Monotonic counter; merges by sum.
    Counter {
        /// Accumulated count.
        value: u64,
    },
    /// Point-in-time gauge; merges by newer observation.
    Gauge {
        /// Last observed value.
        value: f64,
        /// When the value was last set.
        updated_at: DateTime<Utc>,
    },
}

/// Serializable snapshot of all metrics at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Unique snapshot id, used by the importer for dedup.
    pub id: Uuid,
    /// When the snapshot was captured.
    pub captured_at: DateTime<Utc>,
    /// Metric name to value.
    pub metrics: BTreeMap<String, Metric>,
}

/// Live metric state for one process instance.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    metrics: BTreeMap<String, Metric>,
    applied_snapshots: HashSet<Uuid>,
}

impl StatsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to a counter, creating it at zero first if needed.
    pub fn incr_counter(&mut self, name: &str, delta: u64) {
        match self.metrics.get_mut(name) {
            Some(Metric::Counter { value }) => *value += delta,
            _ => {
                self.metrics
                    .insert(name.to_string(), Metric::Counter { value: delta });
            },
        }
    }

    /// Set a gauge to a new observation.
    pub fn set_gauge(&mut self, name: &str, value: f64) {
        self.metrics.insert(
            name.to_string(),
            Metric::Gauge {
                value,
                updated_at: Utc::now(),
            },
        );
    }

    /// Read a counter's current value.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        match self.metrics.get(name) {
            Some(Metric::Counter { value }) => *value,
            _ => 0,
        }
    }

    /// Read a gauge's current value.
    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name) {
            Some(Metric::Gauge { value, .. }) => Some(*value),
            _ => None,
        }
    }

    /// Capture a snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            id: Uuid::new_v4(),
            captured_at: Utc::now(),
            metrics: self.metrics.clone(),
        }
    }

    /// Merge a snapshot from the other instance.
    ///
    /// Counters are summed, gauges keep the newer observation. A snapshot
    /// whose id was already applied is a no-op, so retried deliveries are
    /// safe.
    pub fn merge(&mut self, snapshot: &StatsSnapshot) {
        if !self.applied_snapshots.insert(snapshot.id) {
            return;
        }

        for (name, incoming) in &snapshot.metrics {
            match (self.metrics.get_mut(name), incoming) {
                (Some(Metric::Counter { value }), Metric::Counter { value: other }) => {
                    *value += other;
                },
                (
                    Some(Metric::Gauge { value, updated_at }),
                    Metric::Gauge {
                        value: other,
                        updated_at: other_at,
                    },
                ) => {
                    if *other_at > *updated_at {
                        *value = *other;
                        *updated_at = *other_at;
                    }
                },
                // Absent locally, or the kind changed across versions:
                // take the incoming value as-is.
                (_, incoming) => {
                    self.metrics.insert(name.clone(), incoming.clone());
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_merge_sums() {
        let mut old = StatsRegistry::new();
        old.incr_counter("requests_total", 40);

        let mut new = StatsRegistry::new();
        new.incr_counter("requests_total", 2);
        new.merge(&old.snapshot());

        assert_eq!(new.counter("requests_total"), 42);
    }

    #[test]
    fn test_merge_is_idempotent_per_snapshot() {
        let mut old = StatsRegistry::new();
        old.incr_counter("requests_total", 10);
        let snap = old.snapshot();

        let mut new = StatsRegistry::new();
        new.merge(&snap);
        new.merge(&snap);
        new.merge(&snap);

        assert_eq!(new.counter("requests_total"), 10);
    }

    #[test]
    fn test_merge_is_associative_across_snapshots() {
        let mut a = StatsRegistry::new();
        a.incr_counter("x", 1);
        let snap_a = a.snapshot();

        let mut b = StatsRegistry::new();
        b.incr_counter("x", 2);
        let snap_b = b.snapshot();

        let mut left = StatsRegistry::new();
        left.incr_counter("x", 4);
        left.merge(&snap_a);
        left.merge(&snap_b);

        let mut right = StatsRegistry::new();
        right.incr_counter("x", 4);
        right.merge(&snap_b);
        right.merge(&snap_a);

        assert_eq!(left.counter("x"), 7);
        assert_eq!(right.counter("x"), 7);
    }

    #[test]
    fn test_gauge_newer_observation_wins() {
        let mut old = StatsRegistry::new();
        old.set_gauge("connections_active", 17.0);
        let snap = old.snapshot();

        // The new instance observed its own value later.
        let mut new = StatsRegistry::new();
        new.set_gauge("connections_active", 3.0);
        new.merge(&snap);
        assert_eq!(new.gauge("connections_active"), Some(3.0));

        // A fresh importer with no observation takes the snapshot's.
        let mut empty = StatsRegistry::new();
        empty.merge(&snap);
        assert_eq!(empty.gauge("connections_active"), Some(17.0));
    }

    #[test]
    fn test_snapshot_serialization_round_trip() {
        let mut registry = StatsRegistry::new();
        registry.incr_counter("bytes_total", 1024);
        registry.set_gauge("connections_active", 2.0);

        let snap = registry.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        let parsed: StatsSnapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, snap.id);
        assert_eq!(parsed.metrics, snap.metrics);
    }
}
