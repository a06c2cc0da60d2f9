use async_trait::async_trait;
use flatshard_core::{Partition, PartitionId, Predicate, Record};
use serde::{Deserialize, Serialize};

/// Pluggable persistence backend that reads and writes whole partitions.
///
/// Implementations: [`MemoryStorage`](crate::storage::MemoryStorage) (tests),
/// [`JsonFileStorage`](crate::storage::JsonFileStorage) (JSON / JSONL files).
/// Concurrent reads of distinct partitions must be safe; the engine never
/// issues concurrent writes to the same partition.
#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Prepare the backend (e.g., create the root directory).
    async fn connect(&self) -> anyhow::Result<()>;

    /// Release resources. Subsequent calls may fail with "not connected".
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Load every record of a partition, in storage order.
    async fn read(&self, partition: &Partition) -> anyhow::Result<Vec<Record>>;

    /// Replace the full contents of a partition.
    async fn write(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()>;

    /// Append records to the end of a partition, creating it if missing.
    async fn append(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()>;

    /// Whether the partition currently exists in storage.
    async fn exists(&self, partition: &Partition) -> anyhow::Result<bool>;

    /// Remove every record matching `predicate`, returning how many were removed.
    ///
    /// The default implementation reads, filters, and rewrites the partition.
    async fn delete(&self, partition: &Partition, predicate: &Predicate) -> anyhow::Result<usize> {
        let records = self.read(partition).await?;
        let before = records.len();
        let kept: Vec<Record> = records.into_iter().filter(|r| !predicate.matches(r)).collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write(partition, &kept).await?;
        }
        Ok(removed)
    }

    /// Number of records in a partition.
    async fn count(&self, partition: &Partition) -> anyhow::Result<usize> {
        Ok(self.read(partition).await?.len())
    }
}

/// Settings stored alongside the partition list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSettings {
    /// Partition that receives inserts when the caller names none.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default_partition_id: Option<PartitionId>,
}

/// Source of partition metadata.
///
/// The engine reads the manifest and registers auto-created partitions, but
/// never persists manifest state itself.
#[async_trait]
pub trait ManifestPort: Send + Sync {
    /// All known partitions, in manifest order.
    async fn get_all_partitions(&self) -> anyhow::Result<Vec<Partition>>;

    /// Look up one partition by id.
    async fn get_partition(&self, id: &str) -> anyhow::Result<Option<Partition>>;

    async fn get_manifest_settings(&self) -> anyhow::Result<ManifestSettings>;

    /// Register a new partition. Re-registering an existing id replaces it.
    async fn add_partition(&self, partition: Partition) -> anyhow::Result<()>;
}
