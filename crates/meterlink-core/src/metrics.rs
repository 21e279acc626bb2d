//! Synchronization metrics.
//!
//! [`SyncMetrics`] is an in-memory [`MetricsPort`] that keeps counters per
//! (device, profile) series: persisted batches with their latency, salvaged
//! rows, and failures by reason. Snapshots are serializable so the service can
//! log or export them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use meterlink_types::ProfileId;
use serde::{Deserialize, Serialize};

use crate::traits::MetricsPort;

/// Latency statistics for one kind of operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetrics {
    /// Total number of operations.
    pub count: u64,
    /// Total duration of all operations.
    pub total_duration_ms: u64,
    /// Minimum operation duration.
    pub min_duration_ms: Option<u64>,
    /// Maximum operation duration.
    pub max_duration_ms: Option<u64>,
    /// Average operation duration.
    pub avg_duration_ms: Option<f64>,
}

/// Thread-safe atomic operation metrics tracker.
#[derive(Debug)]
pub struct AtomicOperationMetrics {
    count: AtomicU64,
    total_duration_ms: AtomicU64,
    min_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl Default for AtomicOperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicOperationMetrics {
    /// Create new empty metrics.
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            min_duration_ms: AtomicU64::new(u64::MAX),
            max_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record one operation.
    pub fn record(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);

        let mut current = self.min_duration_ms.load(Ordering::Relaxed);
        while ms < current {
            match self.min_duration_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }

        let mut current = self.max_duration_ms.load(Ordering::Relaxed);
        while ms > current {
            match self.max_duration_ms.compare_exchange_weak(
                current,
                ms,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(c) => current = c,
            }
        }
    }

    /// Get a snapshot of the current metrics.
    pub fn snapshot(&self) -> OperationMetrics {
        let count = self.count.load(Ordering::Relaxed);
        let total_duration_ms = self.total_duration_ms.load(Ordering::Relaxed);
        let min = self.min_duration_ms.load(Ordering::Relaxed);
        let max = self.max_duration_ms.load(Ordering::Relaxed);

        OperationMetrics {
            count,
            total_duration_ms,
            min_duration_ms: (min != u64::MAX).then_some(min),
            max_duration_ms: (count > 0).then_some(max),
            avg_duration_ms: (count > 0).then(|| total_duration_ms as f64 / count as f64),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.total_duration_ms.store(0, Ordering::Relaxed);
        self.min_duration_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_duration_ms.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct SeriesMetrics {
    batches: AtomicOperationMetrics,
    rows: AtomicU64,
    recoveries: AtomicU64,
    recovered_rows: AtomicU64,
    failures: Mutex<BTreeMap<String, u64>>,
}

/// Serializable view of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    /// Device serial.
    pub device_id: String,
    /// Profile id.
    pub profile_id: ProfileId,
    /// Persisted batches.
    pub batches: OperationMetrics,
    /// Rows handed to persistence.
    pub rows: u64,
    /// Reads that ended in a salvage.
    pub recoveries: u64,
    /// Rows salvaged from partial buffers.
    pub recovered_rows: u64,
    /// Failures by reason.
    pub failures: BTreeMap<String, u64>,
}

/// In-memory [`MetricsPort`].
#[derive(Debug, Default)]
pub struct SyncMetrics {
    series: DashMap<(String, ProfileId), Arc<SeriesMetrics>>,
}

impl SyncMetrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared registry.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn series(&self, device_id: &str, profile_id: &ProfileId) -> Arc<SeriesMetrics> {
        Arc::clone(
            self.series
                .entry((device_id.to_string(), profile_id.clone()))
                .or_default()
                .value(),
        )
    }

    /// Snapshot of one series.
    pub fn snapshot(&self, device_id: &str, profile_id: &ProfileId) -> Option<SeriesSnapshot> {
        let key = (device_id.to_string(), profile_id.clone());
        self.series
            .get(&key)
            .map(|entry| Self::to_snapshot(&key, entry.value()))
    }

    /// Snapshots of every series, ordered by device then profile.
    pub fn summary(&self) -> Vec<SeriesSnapshot> {
        let mut all: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| Self::to_snapshot(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| {
            (a.device_id.as_str(), a.profile_id.as_str())
                .cmp(&(b.device_id.as_str(), b.profile_id.as_str()))
        });
        all
    }

    /// How often `reason` was recorded for a series.
    pub fn failure_count(&self, device_id: &str, profile_id: &ProfileId, reason: &str) -> u64 {
        self.snapshot(device_id, profile_id)
            .and_then(|s| s.failures.get(reason).copied())
            .unwrap_or(0)
    }

    /// Forget every series.
    pub fn reset(&self) {
        self.series.clear();
    }

    fn to_snapshot(key: &(String, ProfileId), series: &SeriesMetrics) -> SeriesSnapshot {
        SeriesSnapshot {
            device_id: key.0.clone(),
            profile_id: key.1.clone(),
            batches: series.batches.snapshot(),
            rows: series.rows.load(Ordering::Relaxed),
            recoveries: series.recoveries.load(Ordering::Relaxed),
            recovered_rows: series.recovered_rows.load(Ordering::Relaxed),
            failures: series
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl MetricsPort for SyncMetrics {
    fn record_batch(
        &self,
        device_id: &str,
        profile_id: &ProfileId,
        count: usize,
        elapsed: Duration,
    ) {
        let series = self.series(device_id, profile_id);
        series.batches.record(elapsed);
        series.rows.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_recovery(&self, device_id: &str, profile_id: &ProfileId, count: usize) {
        let series = self.series(device_id, profile_id);
        series.recoveries.fetch_add(1, Ordering::Relaxed);
        series
            .recovered_rows
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, device_id: &str, profile_id: &ProfileId, reason: &str) {
        let series = self.series(device_id, profile_id);
        *series
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_metrics() {
        let metrics = AtomicOperationMetrics::new();
        assert_eq!(metrics.snapshot().max_duration_ms, None);

        metrics.record(Duration::from_millis(100));
        metrics.record(Duration::from_millis(200));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.min_duration_ms, Some(100));
        assert_eq!(snapshot.max_duration_ms, Some(200));
        assert_eq!(snapshot.avg_duration_ms, Some(150.0));

        metrics.reset();
        assert_eq!(metrics.snapshot().count, 0);
    }

    #[test]
    fn test_sync_metrics_per_series() {
        let metrics = SyncMetrics::new();
        let lp = ProfileId::from("load_profile_1");
        let daily = ProfileId::from("daily_billing");

        metrics.record_batch("M1", &lp, 4, Duration::from_millis(30));
        metrics.record_batch("M1", &lp, 2, Duration::from_millis(10));
        metrics.record_recovery("M1", &lp, 3);
        metrics.record_failure("M1", &daily, "recovery_failed");

        let snapshot = metrics.snapshot("M1", &lp).unwrap();
        assert_eq!(snapshot.batches.count, 2);
        assert_eq!(snapshot.rows, 6);
        assert_eq!(snapshot.recoveries, 1);
        assert_eq!(snapshot.recovered_rows, 3);
        assert!(snapshot.failures.is_empty());

        assert_eq!(metrics.failure_count("M1", &daily, "recovery_failed"), 1);
        assert_eq!(metrics.failure_count("M2", &daily, "recovery_failed"), 0);

        let summary = metrics.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].profile_id, daily);
    }
}
