//! Query result cache.
//!
//! - [`store`]: the thread-safe [`Cache`] with TTL, statistics, and pattern
//!   invalidation
//! - [`eviction`]: LRU / LFU / FIFO victim selection behind
//!   [`EvictionStrategy`]

pub mod eviction;
pub mod store;

pub use eviction::{strategy_for, EntryMeta, EvictionStrategy, FifoStrategy, LfuStrategy, LruStrategy};
pub use store::{Cache, CacheEntry, CacheStats, InvalidationRule};
