//! In-memory [`StoragePort`] implementation.
//!
//! [`MemoryStorage`] keeps each partition's records in a [`DashMap`] keyed by
//! partition location. Besides serving as a lightweight backend it exposes
//! hooks for injecting transient failures and read latency, which the engine
//! tests use to exercise retry and isolation paths.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use flatshard_core::{Partition, Record};
use parking_lot::RwLock;

use crate::error::StorageError;
use crate::traits::StoragePort;

/// `DashMap`-backed storage. Starts connected.
pub struct MemoryStorage {
    partitions: DashMap<String, Vec<Record>>,
    connected: AtomicBool,
    /// Remaining injected failures per location.
    failures: DashMap<String, u32>,
    read_delay: RwLock<Option<Duration>>,
    reads: AtomicUsize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            connected: AtomicBool::new(true),
            failures: DashMap::new(),
            read_delay: RwLock::new(None),
            reads: AtomicUsize::new(0),
        }
    }

    /// Replaces the contents stored at `location`.
    pub fn seed(&self, location: impl Into<String>, records: Vec<Record>) {
        self.partitions.insert(location.into(), records);
    }

    /// Makes the next `times` operations on `location` fail with
    /// [`StorageError::Unavailable`]. `u32::MAX` fails indefinitely.
    pub fn inject_failures(&self, location: impl Into<String>, times: u32) {
        self.failures.insert(location.into(), times);
    }

    /// Delays every read by `delay`.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write() = delay;
    }

    /// Number of `read` calls served (including failed ones).
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Snapshot of the records at `location`.
    pub fn records(&self, location: &str) -> Option<Vec<Record>> {
        self.partitions.get(location).map(|r| r.value().clone())
    }

    fn check(&self, location: &str) -> Result<(), StorageError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::NotConnected);
        }
        if let Some(mut remaining) = self.failures.get_mut(location) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(StorageError::Unavailable {
                    location: location.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn connect(&self) -> anyhow::Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, partition: &Partition) -> anyhow::Result<Vec<Record>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(&partition.location)?;
        let records = self
            .partitions
            .get(&partition.location)
            .map(|r| r.value().clone())
            .ok_or_else(|| StorageError::NotFound {
                location: partition.location.clone(),
            })?;
        Ok(records)
    }

    async fn write(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()> {
        self.check(&partition.location)?;
        self.partitions
            .insert(partition.location.clone(), records.to_vec());
        Ok(())
    }

    async fn append(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()> {
        self.check(&partition.location)?;
        self.partitions
            .entry(partition.location.clone())
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }

    async fn exists(&self, partition: &Partition) -> anyhow::Result<bool> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::NotConnected.into());
        }
        Ok(self.partitions.contains_key(&partition.location))
    }
}

#[cfg(test)]
mod tests {
    use flatshard_core::Predicate;
    use serde_json::json;

    use super::*;

    fn partition() -> Partition {
        Partition::new("p1", "p1.json")
    }

    #[tokio::test]
    async fn append_creates_and_extends() {
        let storage = MemoryStorage::new();
        let p = partition();
        assert!(!storage.exists(&p).await.unwrap());

        storage.append(&p, &[json!({"id": 1})]).await.unwrap();
        storage.append(&p, &[json!({"id": 2})]).await.unwrap();
        assert!(storage.exists(&p).await.unwrap());
        assert_eq!(storage.count(&p).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn default_delete_rewrites_survivors() {
        let storage = MemoryStorage::new();
        let p = partition();
        storage.seed("p1.json", vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);

        let removed = storage.delete(&p, &Predicate::gte("n", json!(2))).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.records("p1.json").unwrap(), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn missing_partition_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.read(&partition()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let storage = MemoryStorage::new();
        storage.seed("p1.json", vec![json!({})]);
        storage.inject_failures("p1.json", 2);

        assert!(storage.read(&partition()).await.is_err());
        assert!(storage.read(&partition()).await.is_err());
        assert_eq!(storage.read(&partition()).await.unwrap().len(), 1);
        assert_eq!(storage.read_count(), 3);
    }

    #[tokio::test]
    async fn disconnected_storage_rejects_calls() {
        let storage = MemoryStorage::new();
        storage.disconnect().await.unwrap();
        let err = storage.append(&partition(), &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NotConnected)
        ));
        storage.connect().await.unwrap();
        assert!(storage.append(&partition(), &[]).await.is_ok());
    }
}
