//! Pipeline state shared by the read and write paths.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use flatshard_core::{Partition, PartitionId, Record};
use serde::Serialize;
use tracing::{debug, info_span, Instrument};

use crate::cache::Cache;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::mapreduce::{MapReduceEngine, MapReduceStatistics};
use crate::resilience::RetryExecutor;
use crate::stream::{StreamOptions, StreamProcessor};
use crate::traits::{ManifestPort, StoragePort};
use crate::worker::{BackgroundWorker, CacheSweeper};

/// Answer to a [`Query`](flatshard_core::Query).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Matching records after sort and pagination.
    pub data: Vec<Record>,
    /// Matching records before pagination.
    pub total: usize,
    pub cache_hit: bool,
    /// Map-reduce statistics of the run that produced `data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<MapReduceStatistics>,
}

/// One async mutex per partition id; serializes writes to a partition.
#[derive(Default)]
pub(crate) struct PartitionLocks {
    locks: DashMap<PartitionId, Arc<tokio::sync::Mutex<()>>>,
}

impl PartitionLocks {
    pub(crate) fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(id.to_string()).or_default().value())
    }
}

/// Orchestrates queries (cache, retry, map-reduce, filter, sort, paginate)
/// and writes (retry, storage, cache invalidation) over the partitions named
/// by a manifest.
pub struct QueryPipeline {
    pub(crate) storage: Arc<dyn StoragePort>,
    pub(crate) manifest: Arc<dyn ManifestPort>,
    pub(crate) cache: Option<Arc<Cache<QueryResult>>>,
    pub(crate) retry: Arc<RetryExecutor>,
    pub(crate) map_reduce: MapReduceEngine,
    pub(crate) streams: StreamProcessor,
    pub(crate) locks: PartitionLocks,
    pub(crate) config: EngineConfig,
    /// Bumped by every write before the query cache is cleared.
    pub(crate) generation: AtomicU64,
}

impl QueryPipeline {
    #[must_use]
    pub fn new(storage: Arc<dyn StoragePort>, manifest: Arc<dyn ManifestPort>, config: EngineConfig) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(Cache::from_config(&config.cache)));
        let retry = Arc::new(RetryExecutor::new(config.retry.clone(), &config.circuit_breaker));
        Self {
            map_reduce: MapReduceEngine::new(Arc::clone(&storage), config.map_reduce.clone()),
            streams: StreamProcessor::new(Arc::clone(&storage), StreamOptions::from(&config.stream)),
            storage,
            manifest,
            cache,
            retry,
            locks: PartitionLocks::default(),
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Replaces the retry executor, e.g. to share one circuit breaker
    /// between several pipelines.
    #[must_use]
    pub fn with_retry_executor(mut self, retry: Arc<RetryExecutor>) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> Option<&Arc<Cache<QueryResult>>> {
        self.cache.as_ref()
    }

    pub fn retry_executor(&self) -> &Arc<RetryExecutor> {
        &self.retry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts the periodic expiry sweep of the query cache.
    ///
    /// Returns `None` when caching is disabled or the sweep interval is zero.
    /// Must be called within a tokio runtime.
    pub fn start_cache_sweeper(&self) -> Option<BackgroundWorker<CacheSweeper<QueryResult>>> {
        let cache = self.cache.as_ref()?;
        let interval = self.config.cache.sweep_interval;
        if interval.is_zero() {
            return None;
        }
        Some(BackgroundWorker::start(CacheSweeper::new(Arc::clone(cache)), interval))
    }

    /// Resolves partition ids against the manifest; `None` means all
    /// partitions in manifest order.
    pub(crate) async fn resolve_partitions(&self, ids: Option<&[PartitionId]>) -> Result<Vec<Partition>, EngineError> {
        let Some(ids) = ids else {
            return self.manifest.get_all_partitions().await.map_err(EngineError::storage);
        };
        let mut partitions = Vec::with_capacity(ids.len());
        for id in ids {
            let partition = self
                .manifest
                .get_partition(id)
                .await
                .map_err(EngineError::storage)?
                .ok_or_else(|| EngineError::NotFound {
                    what: "partition",
                    id: id.clone(),
                })?;
            partitions.push(partition);
        }
        Ok(partitions)
    }

    /// Current write generation. A query result may only stay cached if the
    /// generation is unchanged between the start of its scan and its insert.
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Caches `result` under `key` unless a write landed since `started_at`.
    ///
    /// The generation is re-checked after the insert so that an invalidation
    /// racing with the insert cannot leave a stale entry behind.
    pub(crate) fn cache_result(&self, key: String, result: &QueryResult, started_at: u64) {
        let Some(cache) = &self.cache else {
            return;
        };
        if self.generation() != started_at {
            debug!(%key, "query result not cached, a write landed during the scan");
            return;
        }
        cache.set(key.clone(), result.clone(), None);
        if self.generation() != started_at {
            cache.delete(&key);
            debug!(%key, "query result dropped, a write landed while caching");
        }
    }

    /// Drops every cached query result and fences off in-flight queries.
    pub(crate) fn invalidate_queries(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cache) = &self.cache {
            let dropped = cache.size();
            cache.clear();
            debug!(dropped, "query cache invalidated");
        }
    }
}

/// Runs a pipeline operation inside an `operation` span and logs its outcome.
pub(crate) async fn traced<T, F>(operation: &'static str, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    let span = info_span!(
        "operation",
        operation,
        duration_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    async move {
        let start = Instant::now();
        let result = fut.await;

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::Span::current().record("outcome", outcome);
        tracing::info!(operation, duration_ms, outcome, "operation complete");
        result
    }
    .instrument(span)
    .await
}
