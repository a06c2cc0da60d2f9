//! Memory-bounded chunked reads over partitions.

use std::mem;
use std::sync::Arc;

use flatshard_core::{estimate_size, Partition, PartitionId, Record};
use futures_util::future;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use super::chunk::{ChunkMetadata, ChunkResult, ChunkStream, StreamChunk, StreamOptions, StreamProgress};
use crate::error::EngineError;
use crate::traits::StoragePort;

/// Size charged for a record that cannot be serialized.
const UNSERIALIZABLE_RECORD_BYTES: usize = 1024;

pub struct StreamProcessor {
    storage: Arc<dyn StoragePort>,
    defaults: StreamOptions,
}

impl StreamProcessor {
    #[must_use]
    pub fn new(storage: Arc<dyn StoragePort>, defaults: StreamOptions) -> Self {
        Self { storage, defaults }
    }

    /// Options used when callers have no per-call overrides.
    #[must_use]
    pub fn default_options(&self) -> StreamOptions {
        self.defaults.clone()
    }

    /// Streams every record of `partitions`, in partition order, as chunks
    /// of at most `chunk_size` records.
    ///
    /// A chunk is cut when the buffer reaches `chunk_size` records or its
    /// estimated size exceeds `max_memory_usage`. Chunks are produced one
    /// ahead of the consumer, so only the last chunk has `has_more == false`.
    /// Must be called within a tokio runtime.
    pub fn stream(&self, partitions: Vec<Partition>, options: StreamOptions) -> ChunkStream {
        let (tx, rx) = mpsc::channel(1);
        let producer = ChunkProducer {
            storage: Arc::clone(&self.storage),
            chunk_size: options.chunk_size.max(1),
            options,
            tx,
        };
        ChunkStream::new(rx, tokio::spawn(producer.run(partitions)))
    }

    /// Streams records converted one by one through `transform`.
    pub fn stream_transform<U, F>(
        &self,
        partitions: Vec<Partition>,
        options: StreamOptions,
        mut transform: F,
    ) -> impl Stream<Item = Result<StreamChunk<U>, EngineError>>
    where
        F: FnMut(Record) -> U,
    {
        self.stream(partitions, options).map(move |item| {
            item.map(|chunk| chunk.map_data(|data| data.into_iter().map(&mut transform).collect()))
        })
    }

    /// Streams only records accepted by `predicate`; chunks left empty are
    /// skipped. `has_more` still reflects the unfiltered stream.
    pub fn stream_filter<F>(
        &self,
        partitions: Vec<Partition>,
        options: StreamOptions,
        mut predicate: F,
    ) -> impl Stream<Item = ChunkResult>
    where
        F: FnMut(&Record) -> bool,
    {
        self.stream(partitions, options).filter_map(move |item| {
            let out = match item {
                Ok(chunk) => {
                    let chunk = chunk.map_data(|data| data.into_iter().filter(|r| predicate(r)).collect());
                    (!chunk.data.is_empty()).then_some(Ok(chunk))
                }
                Err(err) => Some(Err(err)),
            };
            future::ready(out)
        })
    }

    /// Folds every streamed record into an accumulator.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields.
    pub async fn stream_reduce<A, F>(
        &self,
        partitions: Vec<Partition>,
        options: StreamOptions,
        init: A,
        mut fold: F,
    ) -> Result<A, EngineError>
    where
        F: FnMut(A, Record) -> A,
    {
        let mut stream = self.stream(partitions, options);
        let mut acc = init;
        while let Some(chunk) = stream.next().await {
            for record in chunk?.data {
                acc = fold(acc, record);
            }
        }
        Ok(acc)
    }

    /// Concatenates every chunk into one vector.
    ///
    /// # Errors
    ///
    /// Returns the first error the stream yields.
    pub async fn collect_all(
        &self,
        partitions: Vec<Partition>,
        options: StreamOptions,
    ) -> Result<Vec<Record>, EngineError> {
        self.stream_reduce(partitions, options, Vec::new(), |mut all, record| {
            all.push(record);
            all
        })
        .await
    }
}

/// Background half of a [`ChunkStream`].
struct ChunkProducer {
    storage: Arc<dyn StoragePort>,
    options: StreamOptions,
    chunk_size: usize,
    tx: mpsc::Sender<ChunkResult>,
}

/// Chunk cut but not yet sent; held back until we know whether another
/// chunk follows.
struct Pending {
    data: Vec<Record>,
    partition_id: PartitionId,
}

struct ProducerState {
    buffer: Vec<(Record, usize)>,
    memory: usize,
    pending: Option<Pending>,
    chunk_index: usize,
    processed_items: u64,
    processed_partitions: usize,
    started: Instant,
}

impl ChunkProducer {
    async fn run(self, partitions: Vec<Partition>) {
        let total = partitions.len();
        let mut state = ProducerState {
            buffer: Vec::with_capacity(self.chunk_size),
            memory: 0,
            pending: None,
            chunk_index: 0,
            processed_items: 0,
            processed_partitions: 0,
            started: Instant::now(),
        };
        let mut last_partition = PartitionId::new();

        for partition in &partitions {
            last_partition.clone_from(&partition.id);
            match self.storage.read(partition).await {
                Ok(records) => {
                    for record in records {
                        let size = estimate_size(&record, UNSERIALIZABLE_RECORD_BYTES);
                        state.buffer.push((record, size));
                        state.memory += size;
                        state.processed_items += 1;
                        self.report(&state, total);

                        if state.buffer.len() >= self.chunk_size
                            || state.memory > self.options.max_memory_usage
                        {
                            let data = Self::drain(&mut state, self.chunk_size);
                            if !self.cut(&mut state, data, &partition.id).await {
                                return;
                            }
                        }
                    }
                }
                Err(err) if self.options.enable_early_termination => {
                    warn!(partition = %partition.id, error = %format!("{err:#}"), "skipping unreadable partition");
                }
                Err(err) => {
                    // Hand over what was read so far, then end with the error.
                    if let Some(pending) = state.pending.take() {
                        if !self.send(&mut state, pending, true).await {
                            return;
                        }
                    }
                    let _ = self.tx.send(Err(EngineError::storage(err))).await;
                    return;
                }
            }
            state.processed_partitions += 1;
        }

        if !state.buffer.is_empty() {
            let data = Self::drain(&mut state, usize::MAX);
            if !self.cut(&mut state, data, &last_partition).await {
                return;
            }
        }
        if let Some(pending) = state.pending.take() {
            self.send(&mut state, pending, false).await;
        }
    }

    fn drain(state: &mut ProducerState, max: usize) -> Vec<Record> {
        let take = state.buffer.len().min(max);
        let rest = state.buffer.split_off(take);
        let drained = mem::replace(&mut state.buffer, rest);
        drained
            .into_iter()
            .map(|(record, size)| {
                state.memory -= size;
                record
            })
            .collect()
    }

    /// Queues a freshly cut chunk, releasing the previously held one.
    async fn cut(&self, state: &mut ProducerState, data: Vec<Record>, partition_id: &str) -> bool {
        let next = Pending {
            data,
            partition_id: partition_id.to_string(),
        };
        match state.pending.replace(next) {
            Some(previous) => self.send(state, previous, true).await,
            None => true,
        }
    }

    /// Returns `false` once the consumer has gone away.
    async fn send(&self, state: &mut ProducerState, pending: Pending, has_more: bool) -> bool {
        let chunk = StreamChunk {
            metadata: ChunkMetadata {
                chunk_index: state.chunk_index,
                partition_id: pending.partition_id,
                item_count: pending.data.len(),
            },
            data: pending.data,
            has_more,
        };
        state.chunk_index += 1;
        self.tx.send(Ok(chunk)).await.is_ok()
    }

    fn report(&self, state: &ProducerState, total_partitions: usize) {
        let Some(callback) = &self.options.progress else {
            return;
        };
        let estimated_time_remaining = if state.processed_partitions == 0 {
            std::time::Duration::ZERO
        } else {
            let remaining = total_partitions.saturating_sub(state.processed_partitions);
            let per_partition = state.started.elapsed()
                / u32::try_from(state.processed_partitions).unwrap_or(u32::MAX);
            per_partition * u32::try_from(remaining).unwrap_or(u32::MAX)
        };
        callback(&StreamProgress {
            processed_items: state.processed_items,
            processed_partitions: state.processed_partitions,
            total_partitions,
            memory_usage: state.memory,
            estimated_time_remaining,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    fn seeded(sizes: &[usize]) -> (Arc<MemoryStorage>, Vec<Partition>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut partitions = Vec::new();
        let mut n = 0;
        for (i, size) in sizes.iter().enumerate() {
            let location = format!("p{i}.json");
            let records = (0..*size)
                .map(|_| {
                    n += 1;
                    json!({"n": n})
                })
                .collect();
            storage.seed(location.clone(), records);
            partitions.push(Partition::new(format!("p{i}"), location));
        }
        (storage, partitions)
    }

    fn processor(storage: Arc<MemoryStorage>) -> StreamProcessor {
        StreamProcessor::new(storage, StreamOptions::default())
    }

    async fn drain(mut stream: ChunkStream) -> Vec<ChunkResult> {
        let mut out = Vec::new();
        while let Some(item) = stream.next_chunk().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn chunks_of_250_records() {
        let (storage, partitions) = seeded(&[150, 100]);
        let processor = processor(storage);
        let chunks: Vec<StreamChunk> = drain(processor.stream(partitions, StreamOptions::default()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        let sizes: Vec<usize> = chunks.iter().map(|c| c.data.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let more: Vec<bool> = chunks.iter().map(|c| c.has_more).collect();
        assert_eq!(more, vec![true, true, false]);
        let indices: Vec<usize> = chunks.iter().map(|c| c.metadata.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(chunks[0].metadata.partition_id, "p0");
        assert_eq!(chunks[1].metadata.partition_id, "p1");
        assert_eq!(chunks[2].metadata.item_count, 50);
        assert_eq!(chunks[0].data[0], json!({"n": 1}));
        assert_eq!(chunks[2].data[49], json!({"n": 250}));
    }

    #[tokio::test]
    async fn exact_multiple_marks_last_full_chunk() {
        let (storage, partitions) = seeded(&[200]);
        let chunks = drain(processor(storage).stream(partitions, StreamOptions::default())).await;
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[1].as_ref().unwrap().has_more);
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let (storage, _) = seeded(&[]);
        let chunks = drain(processor(storage).stream(Vec::new(), StreamOptions::default())).await;
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn memory_limit_cuts_early() {
        let (storage, partitions) = seeded(&[10]);
        // Each {"n":k} record is 7 or 8 bytes; two exceed 10 bytes.
        let options = StreamOptions {
            max_memory_usage: 10,
            ..StreamOptions::default()
        };
        let chunks = drain(processor(storage).stream(partitions, options)).await;
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.as_ref().unwrap().data.len() == 2));
    }

    #[tokio::test]
    async fn unreadable_partition_is_skipped_by_default() {
        let (storage, mut partitions) = seeded(&[3, 4]);
        partitions.insert(1, Partition::new("ghost", "ghost.json"));
        let records = processor(storage)
            .collect_all(partitions, StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 7);
    }

    #[tokio::test]
    async fn unreadable_partition_ends_stream_without_early_termination() {
        let (storage, mut partitions) = seeded(&[3, 4]);
        partitions.insert(1, Partition::new("ghost", "ghost.json"));
        let options = StreamOptions {
            enable_early_termination: false,
            chunk_size: 2,
            ..StreamOptions::default()
        };
        let items = drain(processor(storage).stream(partitions, options)).await;
        let last = items.last().unwrap();
        assert!(last.is_err());
        let delivered: usize = items.iter().filter_map(|i| i.as_ref().ok()).map(|c| c.data.len()).sum();
        assert_eq!(delivered, 2);
    }

    #[tokio::test]
    async fn progress_reports_every_record() {
        let (storage, partitions) = seeded(&[2, 3]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let options = StreamOptions::default().with_progress(move |p| sink.lock().push(p.clone()));

        processor(storage).collect_all(partitions, options).await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[0].processed_partitions, 0);
        assert_eq!(seen[0].estimated_time_remaining, Duration::ZERO);
        assert_eq!(seen[4].processed_items, 5);
        assert_eq!(seen[4].processed_partitions, 1);
        assert_eq!(seen[4].total_partitions, 2);
    }

    #[tokio::test]
    async fn transform_filter_and_reduce_compose() {
        let (storage, partitions) = seeded(&[5, 5]);
        let processor = processor(storage);
        let options = StreamOptions::default().with_chunk_size(3);

        let doubled: Vec<i64> = processor
            .stream_transform(partitions.clone(), options.clone(), |r| r["n"].as_i64().unwrap_or(0) * 2)
            .map(|c| c.unwrap().data)
            .concat()
            .await;
        assert_eq!(doubled.len(), 10);
        assert_eq!(doubled[9], 20);

        let evens: Vec<StreamChunk> = processor
            .stream_filter(partitions.clone(), options.clone(), |r| r["n"].as_i64() == Some(2))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(evens.len(), 1);
        assert_eq!(evens[0].metadata.item_count, 1);

        let sum = processor
            .stream_reduce(partitions, options, 0, |acc, r| acc + r["n"].as_i64().unwrap_or(0))
            .await
            .unwrap();
        assert_eq!(sum, 55);
    }

    #[tokio::test]
    async fn dropping_the_stream_stops_reading() {
        let (storage, partitions) = seeded(&[1, 1, 1, 1, 1, 1]);
        let processor = processor(Arc::clone(&storage));
        let mut stream = processor.stream(partitions, StreamOptions::default().with_chunk_size(1));
        assert!(stream.next_chunk().await.is_some());
        drop(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(storage.read_count() < 6);
    }
}
