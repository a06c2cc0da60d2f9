//! File-backed [`StoragePort`]: one file per partition under a root directory.
//!
//! Locations ending in `.jsonl` hold one JSON record per line; any other
//! location holds a single JSON array. Full rewrites go through a sibling
//! temp file and a rename so readers never observe a half-written file.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use flatshard_core::{Partition, Record};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::StorageError;
use crate::traits::StoragePort;

pub struct JsonFileStorage {
    root: PathBuf,
    connected: AtomicBool,
}

fn is_json_lines(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "jsonl")
}

fn io_error(location: &str, source: std::io::Error) -> StorageError {
    if source.kind() == IoErrorKind::NotFound {
        StorageError::NotFound {
            location: location.to_string(),
        }
    } else {
        StorageError::Io {
            location: location.to_string(),
            source,
        }
    }
}

/// Parses file contents in the format implied by the path.
fn decode(path: &Path, location: &str, raw: &str) -> Result<Vec<Record>, StorageError> {
    if is_json_lines(path) {
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line).map_err(|source| StorageError::Decode {
                    location: location.to_string(),
                    line: idx + 1,
                    source,
                })
            })
            .collect()
    } else if raw.trim().is_empty() {
        Ok(Vec::new())
    } else {
        serde_json::from_str(raw).map_err(|source| StorageError::Decode {
            location: location.to_string(),
            line: source.line(),
            source,
        })
    }
}

fn encode(path: &Path, location: &str, records: &[Record]) -> Result<Vec<u8>, StorageError> {
    let encode_err = |source| StorageError::Encode {
        location: location.to_string(),
        source,
    };
    if is_json_lines(path) {
        let mut out = Vec::new();
        for record in records {
            serde_json::to_writer(&mut out, record).map_err(encode_err)?;
            out.push(b'\n');
        }
        Ok(out)
    } else {
        serde_json::to_vec_pretty(records).map_err(encode_err)
    }
}

impl JsonFileStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            connected: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, partition: &Partition) -> Result<PathBuf, StorageError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(StorageError::NotConnected);
        }
        Ok(self.root.join(&partition.location))
    }

    async fn replace(&self, path: &Path, location: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(location, e))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(location, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_error(location, e))
    }
}

#[async_trait]
impl StoragePort for JsonFileStorage {
    async fn connect(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root.display().to_string(), e))?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(root = %self.root.display(), "json file storage connected");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, partition: &Partition) -> anyhow::Result<Vec<Record>> {
        let path = self.path_of(partition)?;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(&partition.location, e))?;
        Ok(decode(&path, &partition.location, &raw)?)
    }

    async fn write(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()> {
        let path = self.path_of(partition)?;
        let bytes = encode(&path, &partition.location, records)?;
        self.replace(&path, &partition.location, &bytes).await?;
        Ok(())
    }

    async fn append(&self, partition: &Partition, records: &[Record]) -> anyhow::Result<()> {
        let path = self.path_of(partition)?;
        if !is_json_lines(&path) {
            // Arrays cannot be extended in place.
            let mut existing = match self.read(partition).await {
                Ok(existing) => existing,
                Err(err)
                    if matches!(
                        err.downcast_ref::<StorageError>(),
                        Some(StorageError::NotFound { .. })
                    ) =>
                {
                    Vec::new()
                }
                Err(err) => return Err(err),
            };
            existing.extend_from_slice(records);
            return self.write(partition, &existing).await;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&partition.location, e))?;
        }
        let bytes = encode(&path, &partition.location, records)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&partition.location, e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| io_error(&partition.location, e))?;
        file.flush()
            .await
            .map_err(|e| io_error(&partition.location, e))?;
        Ok(())
    }

    async fn exists(&self, partition: &Partition) -> anyhow::Result<bool> {
        let path = self.path_of(partition)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&partition.location, e))?)
    }
}

#[cfg(test)]
mod tests {
    use flatshard_core::Predicate;
    use serde_json::json;

    use super::*;

    async fn connected(dir: &tempfile::TempDir) -> JsonFileStorage {
        let storage = JsonFileStorage::new(dir.path());
        storage.connect().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn jsonl_roundtrip_through_append() {
        let dir = tempfile::tempdir().unwrap();
        let storage = connected(&dir).await;
        let p = Partition::new("events", "events.jsonl");

        storage.append(&p, &[json!({"id": 1}), json!({"id": 2})]).await.unwrap();
        storage.append(&p, &[json!({"id": 3})]).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("events.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 3);
        let ids: Vec<_> = storage.read(&p).await.unwrap().into_iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn json_array_append_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = connected(&dir).await;
        let p = Partition::new("users", "nested/users.json");

        storage.append(&p, &[json!({"age": 30})]).await.unwrap();
        storage.append(&p, &[json!({"age": 12})]).await.unwrap();
        assert_eq!(storage.count(&p).await.unwrap(), 2);

        let removed = storage.delete(&p, &Predicate::lt("age", json!(18))).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.read(&p).await.unwrap(), vec![json!({"age": 30})]);
        assert!(!dir.path().join("nested/users.json.tmp").exists());
    }

    #[tokio::test]
    async fn malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{\"a\":1}\n\nnot json\n").unwrap();
        let storage = connected(&dir).await;

        let err = storage.read(&Partition::new("bad", "bad.jsonl")).await.unwrap_err();
        match err.downcast_ref::<StorageError>() {
            Some(StorageError::Decode { line, .. }) => assert_eq!(*line, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_file_and_disconnected_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path());
        let p = Partition::new("x", "x.json");

        let err = storage.read(&p).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::NotConnected)));

        storage.connect().await.unwrap();
        assert!(!storage.exists(&p).await.unwrap());
        let err = storage.read(&p).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::NotFound { .. })));
    }
}
