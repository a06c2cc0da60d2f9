//! Write path. Every write goes through the retry executor, holds the
//! partition's write lock, and invalidates the query cache whether or not it
//! succeeds.

use flatshard_core::{Partition, PartitionId, Predicate, Record, ID_FIELD};
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use super::state::{traced, QueryPipeline};
use crate::error::EngineError;

impl QueryPipeline {
    /// Appends `records` to a partition and returns them as stored.
    ///
    /// The target is `partition_id`, else the manifest's default partition,
    /// else the configured `default_partition_id`; it is registered with the
    /// manifest (as `<id>.jsonl`) when missing. Records without an `id`
    /// receive a UUID.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] if any record is not a JSON object;
    /// otherwise storage or manifest failures after retries.
    pub async fn insert(&self, records: Vec<Record>, partition_id: Option<&str>) -> Result<Vec<Record>, EngineError> {
        traced("insert", async {
            let records = prepare_records(records)?;
            if records.is_empty() {
                return Ok(records);
            }
            let partition = self.insert_target(partition_id).await?;

            let lock = self.locks.lock_for(&partition.id);
            let _guard = lock.lock().await;
            let partition = &partition;
            let batch = records.as_slice();
            let outcome = self
                .retry
                .execute(|| async move {
                    self.storage
                        .append(partition, batch)
                        .await
                        .map_err(EngineError::storage)
                })
                .await;
            self.invalidate_queries();
            outcome.into_result()?;

            info!(partition = %partition.id, inserted = records.len(), "records inserted");
            Ok(records)
        })
        .await
    }

    /// Merges `changes` into every record matching `filter`, in one partition
    /// or in all of them. Returns the number of records updated.
    ///
    /// # Errors
    ///
    /// Fails when the partition is unknown or storage fails after retries.
    pub async fn update(
        &self,
        filter: &Predicate,
        changes: &Map<String, Value>,
        partition_id: Option<&str>,
    ) -> Result<usize, EngineError> {
        traced("update", async {
            let partitions = self.write_targets(partition_id).await?;
            let result = self.update_partitions(&partitions, filter, changes).await;
            self.invalidate_queries();
            let updated = result?;
            info!(updated, "records updated");
            Ok(updated)
        })
        .await
    }

    async fn update_partitions(
        &self,
        partitions: &[Partition],
        filter: &Predicate,
        changes: &Map<String, Value>,
    ) -> Result<usize, EngineError> {
        let mut updated = 0;
        for partition in partitions {
            let lock = self.locks.lock_for(&partition.id);
            let _guard = lock.lock().await;
            let outcome = self
                .retry
                .execute(|| async move {
                    let mut records = self.storage.read(partition).await.map_err(EngineError::storage)?;
                    let mut matched = 0;
                    for record in records.iter_mut().filter(|r| filter.matches(r)) {
                        if let Some(fields) = record.as_object_mut() {
                            for (field, value) in changes {
                                fields.insert(field.clone(), value.clone());
                            }
                            matched += 1;
                        }
                    }
                    if matched > 0 {
                        self.storage
                            .write(partition, &records)
                            .await
                            .map_err(EngineError::storage)?;
                    }
                    Ok::<_, EngineError>(matched)
                })
                .await;
            updated += outcome.into_result()?;
        }
        Ok(updated)
    }

    /// Removes every record matching `filter`, in one partition or in all of
    /// them. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Fails when the partition is unknown or storage fails after retries.
    pub async fn delete(&self, filter: &Predicate, partition_id: Option<&str>) -> Result<usize, EngineError> {
        traced("delete", async {
            let partitions = self.write_targets(partition_id).await?;
            let mut result = Ok(0);
            for partition in &partitions {
                let lock = self.locks.lock_for(&partition.id);
                let _guard = lock.lock().await;
                let outcome = self
                    .retry
                    .execute(|| async move {
                        self.storage
                            .delete(partition, filter)
                            .await
                            .map_err(EngineError::storage)
                    })
                    .await;
                match outcome.into_result() {
                    Ok(removed) => result = result.map(|total| total + removed),
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                }
            }
            self.invalidate_queries();
            let deleted = result?;
            info!(deleted, "records deleted");
            Ok(deleted)
        })
        .await
    }

    /// Partition receiving an insert, registering it when it is new.
    async fn insert_target(&self, partition_id: Option<&str>) -> Result<Partition, EngineError> {
        let id: PartitionId = match partition_id {
            Some(id) => id.to_string(),
            None => self
                .manifest
                .get_manifest_settings()
                .await
                .map_err(EngineError::storage)?
                .default_partition_id
                .unwrap_or_else(|| self.config.default_partition_id.clone()),
        };
        if let Some(existing) = self.manifest.get_partition(&id).await.map_err(EngineError::storage)? {
            return Ok(existing);
        }
        let partition = Partition::new(id.clone(), format!("{id}.jsonl"));
        self.manifest
            .add_partition(partition.clone())
            .await
            .map_err(EngineError::storage)?;
        info!(partition = %id, "created partition");
        Ok(partition)
    }

    async fn write_targets(&self, partition_id: Option<&str>) -> Result<Vec<Partition>, EngineError> {
        match partition_id {
            Some(id) => {
                let ids = [id.to_string()];
                self.resolve_partitions(Some(&ids[..])).await
            }
            None => self.resolve_partitions(None).await,
        }
    }
}

/// Rejects non-object records and assigns missing ids.
fn prepare_records(records: Vec<Record>) -> Result<Vec<Record>, EngineError> {
    records
        .into_iter()
        .enumerate()
        .map(|(idx, mut record)| {
            let Some(fields) = record.as_object_mut() else {
                return Err(EngineError::Validation(format!(
                    "record at index {idx} is not a JSON object"
                )));
            };
            if !fields.contains_key(ID_FIELD) {
                fields.insert(ID_FIELD.to_string(), Value::String(Uuid::new_v4().to_string()));
            }
            Ok(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use flatshard_core::Query;
    use serde_json::json;

    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::storage::{MemoryManifest, MemoryStorage};
    use crate::traits::ManifestPort;

    fn setup(manifest: MemoryManifest) -> (QueryPipeline, Arc<MemoryStorage>, Arc<MemoryManifest>) {
        let storage = Arc::new(MemoryStorage::new());
        let manifest = Arc::new(manifest);
        let mut config = EngineConfig::default();
        config.retry.base_delay = std::time::Duration::from_millis(1);
        let pipeline = QueryPipeline::new(
            Arc::clone(&storage) as _,
            Arc::clone(&manifest) as _,
            config,
        );
        (pipeline, storage, manifest)
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_creates_default_partition() {
        let (pipeline, storage, manifest) = setup(MemoryManifest::default());
        let stored = pipeline
            .insert(vec![json!({"name": "ada"}), json!({"id": 7, "name": "bob"})], None)
            .await
            .unwrap();

        assert!(stored[0]["id"].is_string());
        assert_eq!(stored[1]["id"], json!(7));
        let partition = manifest.get_partition("default").await.unwrap().unwrap();
        assert_eq!(partition.location, "default.jsonl");
        assert_eq!(storage.records("default.jsonl").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn insert_prefers_manifest_default() {
        let (pipeline, storage, _) = setup(
            MemoryManifest::new(vec![Partition::new("main", "main.json")]).with_default_partition("main"),
        );
        pipeline.insert(vec![json!({"x": 1})], None).await.unwrap();
        assert_eq!(storage.records("main.json").unwrap().len(), 1);

        pipeline.insert(vec![json!({"x": 2})], Some("side")).await.unwrap();
        assert_eq!(storage.records("side.jsonl").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_non_objects() {
        let (pipeline, storage, _) = setup(MemoryManifest::default());
        let err = pipeline
            .insert(vec![json!({"ok": true}), json!([1, 2])], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("index 1"));
        assert!(storage.records("default.jsonl").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_retries_transient_failures() {
        let (pipeline, storage, _) =
            setup(MemoryManifest::new(vec![Partition::new("p", "p.json")]));
        storage.inject_failures("p.json", 2);
        pipeline.insert(vec![json!({"id": 1})], Some("p")).await.unwrap();
        assert_eq!(storage.records("p.json").unwrap(), vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn update_merges_fields_into_matches() {
        let (pipeline, storage, _) = setup(MemoryManifest::new(vec![
            Partition::new("a", "a.json"),
            Partition::new("b", "b.json"),
        ]));
        storage.seed("a.json", vec![json!({"id": 1, "role": "user"}), json!({"id": 2, "role": "admin"})]);
        storage.seed("b.json", vec![json!({"id": 3, "role": "admin"})]);

        let changes = json!({"role": "owner", "level": 9});
        let updated = pipeline
            .update(&Predicate::eq("role", json!("admin")), changes.as_object().unwrap(), None)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(storage.records("a.json").unwrap()[1], json!({"id": 2, "role": "owner", "level": 9}));
        assert_eq!(storage.records("a.json").unwrap()[0], json!({"id": 1, "role": "user"}));

        let none = pipeline
            .update(&Predicate::eq("role", json!("ghost")), changes.as_object().unwrap(), Some("b"))
            .await
            .unwrap();
        assert_eq!(none, 0);
    }

    #[tokio::test]
    async fn delete_counts_removed_records() {
        let (pipeline, storage, _) = setup(MemoryManifest::new(vec![
            Partition::new("a", "a.json"),
            Partition::new("b", "b.json"),
        ]));
        storage.seed("a.json", vec![json!({"n": 1}), json!({"n": 5})]);
        storage.seed("b.json", vec![json!({"n": 7})]);

        let removed = pipeline.delete(&Predicate::gt("n", json!(2)), None).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.records("b.json").unwrap(), Vec::<Record>::new());

        let err = pipeline.delete(&Predicate::all(), Some("zzz")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn writes_invalidate_cached_queries() {
        let (pipeline, _, _) = setup(MemoryManifest::new(vec![Partition::new("a", "a.jsonl")]));
        pipeline.insert(vec![json!({"id": 1})], Some("a")).await.unwrap();

        let before = pipeline.query(&Query::new()).await.unwrap();
        assert_eq!(before.data.len(), 1);
        assert_eq!(pipeline.cache().unwrap().size(), 1);

        pipeline.insert(vec![json!({"id": 2})], Some("a")).await.unwrap();
        assert_eq!(pipeline.cache().unwrap().size(), 0);

        let after = pipeline.query(&Query::new()).await.unwrap();
        assert!(!after.cache_hit);
        assert_eq!(after.data.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_query_keeps_its_result_out_of_the_cache() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("a.json", vec![json!({"id": 1})]);
        storage.seed("b.json", vec![json!({"id": 2})]);
        storage.set_read_delay(Some(Duration::from_millis(100)));
        let manifest = Arc::new(MemoryManifest::new(vec![
            Partition::new("a", "a.json"),
            Partition::new("b", "b.json"),
        ]));
        let mut config = EngineConfig::default();
        config.map_reduce.parallel = false;
        let pipeline = Arc::new(QueryPipeline::new(Arc::clone(&storage) as _, manifest, config));

        let in_flight = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.query(&Query::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        pipeline.insert(vec![json!({"id": 3})], Some("a")).await.unwrap();

        let stale = in_flight.await.unwrap().unwrap();
        assert_eq!(stale.data.len(), 2);
        assert_eq!(pipeline.cache().unwrap().size(), 0);

        let after = pipeline.query(&Query::new()).await.unwrap();
        assert!(!after.cache_hit);
        assert_eq!(after.data.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_inserts_to_one_partition_are_serialized() {
        let (pipeline, storage, _) = setup(MemoryManifest::new(vec![Partition::new("p", "p.json")]));
        let pipeline = Arc::new(pipeline);
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move { pipeline.insert(vec![json!({"id": i})], Some("p")).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(storage.records("p.json").unwrap().len(), 20);
    }
}
