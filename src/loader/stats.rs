//! Operation statistics for one loader run.
//!
//! Every component increments the same `OperationStats` through a shared
//! reference. Counters are atomics so increments never need ordering.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Mutable counters owned by a single loader run.
#[derive(Debug)]
pub struct OperationStats {
    /// Statements issued, including probes and integrity queries
    queries: AtomicU64,
    /// Rows inserted
    inserts: AtomicU64,
    /// Existing rows updated
    updates: AtomicU64,
    /// Rows left alone (conflicts, existing matches)
    skips: AtomicU64,
    /// Non-fatal and fatal error messages, in order
    errors: Mutex<Vec<String>>,
    /// Wall-clock start of the run
    started_at: DateTime<Utc>,
    /// Monotonic start used for the duration
    start: Instant,
    /// Set once by `finish`
    duration: Mutex<Option<Duration>>,
}

impl Default for OperationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationStats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            skips: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            started_at: Utc::now(),
            start: Instant::now(),
            duration: Mutex::new(None),
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inserts(&self, count: usize) {
        self.inserts.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_updates(&self, count: usize) {
        self.updates.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_skips(&self, count: usize) {
        self.skips.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        self.errors.lock().push(message.into());
    }

    /// Freeze the elapsed time. Later calls keep the first measurement.
    pub fn finish(&self) -> Duration {
        *self
            .duration
            .lock()
            .get_or_insert_with(|| self.start.elapsed())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let duration = (*self.duration.lock()).unwrap_or_else(|| self.start.elapsed());
        StatsSnapshot {
            queries: self.queries.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            skips: self.skips.load(Ordering::Relaxed),
            errors: self.errors.lock().clone(),
            started_at: self.started_at,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }
}

/// Read-only copy of the counters, taken when a run is summarised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Statements issued
    pub queries: u64,
    /// Rows inserted
    pub inserts: u64,
    /// Existing rows updated
    pub updates: u64,
    /// Rows skipped
    pub skips: u64,
    /// Error messages recorded during the run
    pub errors: Vec<String>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Elapsed time, frozen at `finish` when it has been called
    pub duration_ms: u64,
}

impl StatsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "inserted {}, updated {}, skipped {}, errors {} ({} queries in {} ms)",
            self.inserts,
            self.updates,
            self.skips,
            self.errors.len(),
            self.queries,
            self.duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate() {
        let stats = OperationStats::new();
        stats.record_query();
        stats.record_query();
        stats.record_inserts(3);
        stats.record_updates(1);
        stats.record_skips(2);
        stats.record_error("chunk 1 failed");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.queries, 2);
        assert_eq!(snapshot.inserts, 3);
        assert_eq!(snapshot.updates, 1);
        assert_eq!(snapshot.skips, 2);
        assert_eq!(snapshot.errors, vec!["chunk 1 failed".to_string()]);
    }

    #[test]
    fn finish_freezes_duration() {
        let stats = OperationStats::new();
        let first = stats.finish();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.finish(), first);
    }

    #[test]
    fn summary_reports_all_counts() {
        let stats = OperationStats::new();
        stats.record_inserts(4);
        stats.record_skips(1);
        let summary = stats.summary();
        assert!(summary.starts_with("inserted 4, updated 0, skipped 1, errors 0"));
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(OperationStats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    stats.record_inserts(1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(stats.snapshot().inserts, 800);
    }
}
