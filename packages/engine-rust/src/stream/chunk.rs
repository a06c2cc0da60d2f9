//! Chunk, progress, and option types for streaming reads.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use flatshard_core::{PartitionId, Record};
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::StreamConfig;
use crate::error::EngineError;

/// Invoked after every buffered record.
pub type ProgressCallback = Arc<dyn Fn(&StreamProgress) + Send + Sync>;

/// Per-call streaming options.
#[derive(Clone)]
pub struct StreamOptions {
    pub chunk_size: usize,
    pub max_memory_usage: usize,
    pub enable_early_termination: bool,
    pub progress: Option<ProgressCallback>,
}

impl StreamOptions {
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StreamProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl From<&StreamConfig> for StreamOptions {
    fn from(config: &StreamConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            max_memory_usage: config.max_memory_usage,
            enable_early_termination: config.enable_early_termination,
            progress: None,
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("chunk_size", &self.chunk_size)
            .field("max_memory_usage", &self.max_memory_usage)
            .field("enable_early_termination", &self.enable_early_termination)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamProgress {
    pub processed_items: u64,
    /// Partitions fully read (or skipped).
    pub processed_partitions: usize,
    pub total_partitions: usize,
    /// Serialized size of the records currently buffered.
    pub memory_usage: usize,
    /// `elapsed / processed_partitions * remaining_partitions`; zero until
    /// the first partition completes.
    pub estimated_time_remaining: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    /// Partition being read when the chunk was cut.
    pub partition_id: PartitionId,
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamChunk<T = Record> {
    pub data: Vec<T>,
    /// `false` only on the final chunk of the stream.
    pub has_more: bool,
    pub metadata: ChunkMetadata,
}

impl<T> StreamChunk<T> {
    /// Rewrites the payload, keeping `item_count` in sync.
    pub fn map_data<U>(self, f: impl FnOnce(Vec<T>) -> Vec<U>) -> StreamChunk<U> {
        let data = f(self.data);
        StreamChunk {
            has_more: self.has_more,
            metadata: ChunkMetadata {
                item_count: data.len(),
                ..self.metadata
            },
            data,
        }
    }
}

pub type ChunkResult = Result<StreamChunk, EngineError>;

/// Ordered, non-restartable sequence of chunks produced by a background
/// reader. Dropping the stream stops the reader.
pub struct ChunkStream {
    rx: mpsc::Receiver<ChunkResult>,
    producer: JoinHandle<()>,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::Receiver<ChunkResult>, producer: JoinHandle<()>) -> Self {
        Self { rx, producer }
    }

    /// Waits for the next chunk; `None` once the stream is exhausted.
    pub async fn next_chunk(&mut self) -> Option<ChunkResult> {
        self.rx.recv().await
    }
}

impl Stream for ChunkStream {
    type Item = ChunkResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.producer.abort();
    }
}
