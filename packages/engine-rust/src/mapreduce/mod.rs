//! Map-reduce over partitions with bounded parallelism and per-partition
//! retry.

pub mod engine;
pub mod statistics;

pub use engine::{AggregateOutput, MapReduceEngine, MapReduceOutput, PartitionStats};
pub use statistics::MapReduceStatistics;
