//! In-memory [`ManifestPort`] implementation.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use flatshard_core::{Partition, PartitionId};
use parking_lot::RwLock;

use crate::traits::{ManifestPort, ManifestSettings};

/// Ordered partition list plus settings, held in memory.
#[derive(Default)]
pub struct MemoryManifest {
    partitions: RwLock<Vec<Partition>>,
    settings: RwLock<ManifestSettings>,
}

impl MemoryManifest {
    #[must_use]
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self {
            partitions: RwLock::new(partitions),
            settings: RwLock::new(ManifestSettings::default()),
        }
    }

    #[must_use]
    pub fn with_default_partition(self, id: impl Into<PartitionId>) -> Self {
        self.settings.write().default_partition_id = Some(id.into());
        self
    }

    /// Builds a manifest with one partition per `*.json` / `*.jsonl` file in
    /// `dir`, sorted by file name. The partition id is the file stem and the
    /// location is the file name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn from_directory(dir: &Path) -> anyhow::Result<Self> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("listing partition directory {}", dir.display()))?;
        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_data = path
                .extension()
                .is_some_and(|ext| ext == "json" || ext == "jsonl");
            if !is_data || !entry.file_type().await?.is_file() {
                continue;
            }
            let (Some(stem), Some(name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            partitions.push(Partition::new(stem, name));
        }
        partitions.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(Self::new(partitions))
    }
}

#[async_trait]
impl ManifestPort for MemoryManifest {
    async fn get_all_partitions(&self) -> anyhow::Result<Vec<Partition>> {
        Ok(self.partitions.read().clone())
    }

    async fn get_partition(&self, id: &str) -> anyhow::Result<Option<Partition>> {
        Ok(self.partitions.read().iter().find(|p| p.id == id).cloned())
    }

    async fn get_manifest_settings(&self) -> anyhow::Result<ManifestSettings> {
        Ok(self.settings.read().clone())
    }

    async fn add_partition(&self, partition: Partition) -> anyhow::Result<()> {
        let mut partitions = self.partitions.write();
        match partitions.iter_mut().find(|p| p.id == partition.id) {
            Some(existing) => *existing = partition,
            None => partitions.push(partition),
        }
        Ok(())
    }
}
