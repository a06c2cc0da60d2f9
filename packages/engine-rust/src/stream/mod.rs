//! Chunked streaming over partitions.

pub mod chunk;
pub mod processor;

pub use chunk::{ChunkMetadata, ChunkResult, ChunkStream, ProgressCallback, StreamChunk, StreamOptions, StreamProgress};
pub use processor::StreamProcessor;
