//! Parallel map-reduce over partitions.
//!
//! The map phase reads each partition through the storage port and applies
//! the map function to every record. Partitions are handed out from a shared
//! queue to at most `max_concurrency` workers, each finishing one partition
//! before taking the next. A failing partition (read error, timeout, or map
//! error) is retried with exponential backoff; once retries are exhausted it
//! is counted in `failures` and contributes nothing. The reduce phase groups
//! pairs by key and calls the reduce function once per key; a reduce error
//! fails the whole call.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flatshard_core::{estimate_size, Partition, PartitionId, Predicate, Record};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::statistics::{MapReduceStatistics, StatsCollector};
use crate::config::MapReduceOptions;
use crate::error::EngineError;
use crate::resilience::backoff_delay;
use crate::traits::StoragePort;

/// Reduced values in key order of first appearance (partition order, then
/// record order), plus execution statistics.
#[derive(Debug, Clone)]
pub struct MapReduceOutput<K, O> {
    pub results: Vec<(K, O)>,
    pub statistics: MapReduceStatistics,
}

/// Per-partition results of [`MapReduceEngine::aggregate`], in input order.
/// Failed partitions are absent.
#[derive(Debug, Clone)]
pub struct AggregateOutput<A> {
    pub results: Vec<(PartitionId, A)>,
    pub statistics: MapReduceStatistics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStats {
    pub partition_id: PartitionId,
    pub record_count: usize,
    /// Serialized size estimate of all records.
    pub size_bytes: usize,
}

pub struct MapReduceEngine {
    storage: Arc<dyn StoragePort>,
    options: MapReduceOptions,
}

impl MapReduceEngine {
    #[must_use]
    pub fn new(storage: Arc<dyn StoragePort>, options: MapReduceOptions) -> Self {
        Self { storage, options }
    }

    #[must_use]
    pub fn options(&self) -> &MapReduceOptions {
        &self.options
    }

    /// Runs `map` over every record of `partitions`, then `reduce` once per
    /// emitted key.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Reduce`] if any reduce call fails. Map-phase
    /// failures never fail the call; they surface in `statistics.failures`.
    pub async fn execute<K, V, O, M, R>(
        &self,
        partitions: &[Partition],
        map: M,
        mut reduce: R,
    ) -> Result<MapReduceOutput<K, O>, EngineError>
    where
        K: Eq + Hash + Clone + Debug,
        M: Fn(&Record, &str) -> anyhow::Result<Vec<(K, V)>>,
        R: FnMut(&K, Vec<V>) -> anyhow::Result<O>,
    {
        let started = Instant::now();
        let stats = StatsCollector::default();

        let map_partition = |records: Vec<Record>, partition: &Partition| -> anyhow::Result<Vec<(K, V)>> {
            let mut pairs = Vec::new();
            for record in &records {
                pairs.extend(map(record, &partition.id)?);
            }
            Ok(pairs)
        };
        let per_partition = self.run_partitions(partitions, &stats, &map_partition).await;

        let mut index: HashMap<K, usize> = HashMap::new();
        let mut groups: Vec<(K, Vec<V>)> = Vec::new();
        for (key, value) in per_partition.into_iter().flatten().flatten() {
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(value),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![value]));
                }
            }
        }

        let mut results = Vec::with_capacity(groups.len());
        for (key, values) in groups {
            let reduced = reduce(&key, values).map_err(|err| EngineError::Reduce {
                key: format!("{key:?}"),
                message: format!("{err:#}"),
            })?;
            results.push((key, reduced));
        }

        let statistics = stats.snapshot(started.elapsed());
        debug!(
            partitions = partitions.len(),
            keys = results.len(),
            failures = statistics.failures,
            "map-reduce complete"
        );
        Ok(MapReduceOutput { results, statistics })
    }

    /// Map phase only; keeps the first value emitted for each key.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature mirrors [`execute`](Self::execute).
    pub async fn map<K, V, M>(
        &self,
        partitions: &[Partition],
        map: M,
    ) -> Result<MapReduceOutput<K, V>, EngineError>
    where
        K: Eq + Hash + Clone + Debug,
        M: Fn(&Record, &str) -> anyhow::Result<Vec<(K, V)>>,
    {
        let output = self
            .execute(partitions, map, |_key, values: Vec<V>| Ok(values.into_iter().next()))
            .await?;
        Ok(MapReduceOutput {
            results: output
                .results
                .into_iter()
                .filter_map(|(key, first)| first.map(|value| (key, value)))
                .collect(),
            statistics: output.statistics,
        })
    }

    /// Applies `aggregate` to each partition's full record set.
    pub async fn aggregate<A, F>(&self, partitions: &[Partition], aggregate: F) -> AggregateOutput<A>
    where
        F: Fn(&[Record], &Partition) -> anyhow::Result<A>,
    {
        let started = Instant::now();
        let stats = StatsCollector::default();
        let work = |records: Vec<Record>, partition: &Partition| aggregate(records.as_slice(), partition);
        let results = self
            .run_partitions(partitions, &stats, &work)
            .await
            .into_iter()
            .zip(partitions)
            .filter_map(|(result, partition)| result.map(|value| (partition.id.clone(), value)))
            .collect();
        AggregateOutput {
            results,
            statistics: stats.snapshot(started.elapsed()),
        }
    }

    /// Number of records matching `filter` (all records when `None`) across
    /// the readable partitions.
    pub async fn count(&self, partitions: &[Partition], filter: Option<&Predicate>) -> (u64, MapReduceStatistics) {
        let output = self
            .aggregate(partitions, |records, _| {
                let n = match filter {
                    Some(predicate) => records.iter().filter(|r| predicate.matches(r)).count(),
                    None => records.len(),
                };
                Ok(n as u64)
            })
            .await;
        let total = output.results.iter().map(|(_, n)| n).sum();
        (total, output.statistics)
    }

    /// Record counts and size estimates for each readable partition.
    pub async fn get_partition_stats(&self, partitions: &[Partition]) -> AggregateOutput<PartitionStats> {
        self.aggregate(partitions, |records, partition| {
            Ok(PartitionStats {
                partition_id: partition.id.clone(),
                record_count: records.len(),
                size_bytes: records.iter().map(|r| estimate_size(r, 0)).sum(),
            })
        })
        .await
    }

    /// Runs `work` on every partition and returns one slot per partition,
    /// `None` where the partition failed.
    async fn run_partitions<T, F>(&self, partitions: &[Partition], stats: &StatsCollector, work: &F) -> Vec<Option<T>>
    where
        F: Fn(Vec<Record>, &Partition) -> anyhow::Result<T>,
    {
        if !self.options.parallel || partitions.len() <= 1 {
            let mut out = Vec::with_capacity(partitions.len());
            for partition in partitions {
                out.push(self.process_partition(partition, stats, work).await);
            }
            return out;
        }

        let slots: Mutex<Vec<Option<T>>> = Mutex::new(partitions.iter().map(|_| None).collect());
        let next = AtomicUsize::new(0);
        let workers = self.options.max_concurrency.clamp(1, partitions.len());

        let slots_ref = &slots;
        let next = &next;
        join_all((0..workers).map(|_| async move {
            loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(partition) = partitions.get(idx) else {
                    break;
                };
                let result = self.process_partition(partition, stats, work).await;
                slots_ref.lock()[idx] = result;
            }
        }))
        .await;

        slots.into_inner()
    }

    async fn process_partition<T, F>(&self, partition: &Partition, stats: &StatsCollector, work: &F) -> Option<T>
    where
        F: Fn(Vec<Record>, &Partition) -> anyhow::Result<T>,
    {
        let retry = &self.options.retry_config;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_partition(partition, work).await {
                Ok((value, items)) => {
                    stats.partition_done(items);
                    return Some(value);
                }
                Err(err) if err.kind().is_terminal() || attempt > retry.max_retries => {
                    stats.partition_failed();
                    warn!(partition = %partition.id, attempts = attempt, error = %err, "partition failed");
                    return None;
                }
                Err(err) => {
                    stats.retried();
                    let delay = backoff_delay(retry, attempt);
                    debug!(partition = %partition.id, attempt, error = %err, "retrying partition");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt_partition<T, F>(&self, partition: &Partition, work: &F) -> Result<(T, usize), EngineError>
    where
        F: Fn(Vec<Record>, &Partition) -> anyhow::Result<T>,
    {
        let records = tokio::time::timeout(self.options.timeout, self.storage.read(partition))
            .await
            .map_err(|_elapsed| EngineError::Timeout {
                operation: format!("read partition {}", partition.id),
                timeout_ms: u64::try_from(self.options.timeout.as_millis()).unwrap_or(u64::MAX),
            })?
            .map_err(EngineError::storage)?;
        let items = records.len();
        let value = work(records, partition).map_err(|err| EngineError::Map {
            partition_id: partition.id.clone(),
            message: format!("{err:#}"),
        })?;
        Ok((value, items))
    }
}
