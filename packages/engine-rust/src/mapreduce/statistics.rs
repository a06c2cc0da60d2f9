use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counters describing one map-reduce call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapReduceStatistics {
    /// Records read from partitions that completed successfully.
    pub items_processed: u64,
    pub partitions_processed: u64,
    /// Partitions dropped after exhausting their retries.
    pub failures: u64,
    pub retries: u64,
    pub execution_time_ms: u64,
}

/// Lock-free accumulator shared by concurrent partition workers.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    items: AtomicU64,
    partitions: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
}

impl StatsCollector {
    pub(crate) fn partition_done(&self, items: usize) {
        self.items.fetch_add(items as u64, Ordering::Relaxed);
        self.partitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn partition_failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("flatshard_partition_failures_total").increment(1);
    }

    pub(crate) fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, elapsed: Duration) -> MapReduceStatistics {
        MapReduceStatistics {
            items_processed: self.items.load(Ordering::Relaxed),
            partitions_processed: self.partitions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let stats = StatsCollector::default();
        stats.partition_done(3);
        stats.partition_done(2);
        stats.partition_failed();
        stats.retried();
        stats.retried();

        assert_eq!(
            stats.snapshot(Duration::from_millis(12)),
            MapReduceStatistics {
                items_processed: 5,
                partitions_processed: 2,
                failures: 1,
                retries: 2,
                execution_time_ms: 12,
            }
        );
    }
}
