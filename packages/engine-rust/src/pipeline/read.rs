//! Read path: cached queries, point lookups, counts, and streaming.

use flatshard_core::{Partition, PartitionId, Predicate, Query, Record, ID_FIELD};
use serde_json::Value;
use tracing::debug;

use super::state::{traced, QueryPipeline, QueryResult};
use crate::error::EngineError;
use crate::mapreduce::{MapReduceStatistics, PartitionStats};
use crate::stream::{ChunkStream, StreamOptions};

impl QueryPipeline {
    /// Answers `query`, from the cache when an identical query is cached.
    ///
    /// # Errors
    ///
    /// Fails when a named partition is unknown, the manifest cannot be read,
    /// or the map-reduce run fails after retries. Unreadable partitions do
    /// not fail the query; they show up in `statistics.failures`.
    pub async fn query(&self, query: &Query) -> Result<QueryResult, EngineError> {
        traced("query", async {
            let key = query.cache_key();
            if let Some(cache) = &self.cache {
                if let Some(mut hit) = cache.get(&key) {
                    debug!(%key, "query served from cache");
                    hit.cache_hit = true;
                    return Ok(hit);
                }
            }

            let started_at = self.generation();
            let partitions = self.resolve_partitions(query.partitions.as_deref()).await?;
            let (records, statistics) = self.scan(&partitions, query).await?;
            let total = records.len();
            let result = QueryResult {
                data: query.finish(records),
                total,
                cache_hit: false,
                statistics: Some(statistics),
            };

            self.cache_result(key, &result, started_at);
            Ok(result)
        })
        .await
    }

    /// Matching records in partition order, before sort and pagination.
    async fn scan(
        &self,
        partitions: &[Partition],
        query: &Query,
    ) -> Result<(Vec<Record>, MapReduceStatistics), EngineError> {
        let outcome = self
            .retry
            .execute(|| async move {
                self.map_reduce
                    .execute(
                        partitions,
                        |record: &Record, partition_id: &str| {
                            Ok(if query.accepts(record) {
                                vec![(partition_id.to_string(), record.clone())]
                            } else {
                                Vec::new()
                            })
                        },
                        |_partition_id: &PartitionId, records: Vec<Record>| Ok(records),
                    )
                    .await
            })
            .await;
        let output = outcome.into_result()?;
        let records = output.results.into_iter().flat_map(|(_, records)| records).collect();
        Ok((records, output.statistics))
    }

    /// First record whose `id` field equals `id`.
    ///
    /// # Errors
    ///
    /// Same as [`query`](Self::query).
    pub async fn get(&self, id: impl Into<Value>) -> Result<Option<Record>, EngineError> {
        let query = Query::new().filter(Predicate::eq(ID_FIELD, id.into())).limit(1);
        Ok(self.query(&query).await?.data.into_iter().next())
    }

    /// Number of records matching `filter` in the given partitions (all
    /// partitions when `None`). Bypasses the cache.
    ///
    /// # Errors
    ///
    /// Fails when a named partition is unknown or the manifest is unreadable.
    pub async fn count(
        &self,
        filter: Option<&Predicate>,
        partition_ids: Option<&[PartitionId]>,
    ) -> Result<u64, EngineError> {
        traced("count", async {
            let partitions = self.resolve_partitions(partition_ids).await?;
            Ok(self.map_reduce.count(&partitions, filter).await.0)
        })
        .await
    }

    /// Record count and size estimate per readable partition.
    ///
    /// # Errors
    ///
    /// Fails when a named partition is unknown or the manifest is unreadable.
    pub async fn partition_stats(
        &self,
        partition_ids: Option<&[PartitionId]>,
    ) -> Result<Vec<PartitionStats>, EngineError> {
        let partitions = self.resolve_partitions(partition_ids).await?;
        let output = self.map_reduce.get_partition_stats(&partitions).await;
        Ok(output.results.into_iter().map(|(_, stats)| stats).collect())
    }

    /// Streams the records of the given partitions (all when `None`) in
    /// chunks. `options` defaults to the engine's stream configuration.
    ///
    /// # Errors
    ///
    /// Fails when a named partition is unknown or the manifest is unreadable.
    pub async fn stream(
        &self,
        partition_ids: Option<&[PartitionId]>,
        options: Option<StreamOptions>,
    ) -> Result<ChunkStream, EngineError> {
        let partitions = self.resolve_partitions(partition_ids).await?;
        let options = options.unwrap_or_else(|| self.streams.default_options());
        Ok(self.streams.stream(partitions, options))
    }
}
