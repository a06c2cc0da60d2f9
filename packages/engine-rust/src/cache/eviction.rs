//! Pluggable eviction strategies for [`Cache`](super::Cache).
//!
//! A strategy keeps whatever auxiliary ordering it needs, updated through
//! `on_add` / `on_access` / `on_remove`, and picks a victim when the cache is
//! full. The cache calls these hooks under its own lock, so strategies need no
//! internal synchronization.

use std::collections::{BTreeMap, HashMap};

use tokio::time::Instant;

use crate::config::EvictionKind;

/// Per-entry bookkeeping visible to strategies during victim selection.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub inserted_at: Instant,
    pub last_access: Instant,
    pub hit_count: u64,
    /// Insertion counter; orders entries whose `inserted_at` is equal.
    pub sequence: u64,
}

impl EntryMeta {
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            inserted_at: now,
            last_access: now,
            hit_count: 0,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Victim selection policy.
pub trait EvictionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// A key was inserted (or overwritten).
    fn on_add(&mut self, key: &str);

    /// A key was read through `get`.
    fn on_access(&mut self, key: &str);

    /// A key left the cache for any reason.
    fn on_remove(&mut self, key: &str);

    /// The cache was cleared.
    fn clear(&mut self);

    /// Chooses the key to evict from the live entries.
    ///
    /// Must return a key whenever `entries` is non-empty.
    fn select_victim(
        &self,
        entries: &mut dyn Iterator<Item = (&str, &EntryMeta)>,
    ) -> Option<String>;
}

/// Builds the strategy for a configured [`EvictionKind`].
#[must_use]
pub fn strategy_for(kind: EvictionKind) -> Box<dyn EvictionStrategy> {
    match kind {
        EvictionKind::Lru => Box::new(LruStrategy::default()),
        EvictionKind::Lfu => Box::new(LfuStrategy),
        EvictionKind::Fifo => Box::new(FifoStrategy::default()),
    }
}

// ---------------------------------------------------------------------------
// Order tracking shared by LRU and FIFO
// ---------------------------------------------------------------------------

/// Ordered key sequence with O(log n) move-to-back and removal.
///
/// Each key carries the tick of its last `touch`; the smallest tick is the
/// front of the sequence.
#[derive(Debug, Default)]
struct OrderTracker {
    by_tick: BTreeMap<u64, String>,
    ticks: HashMap<String, u64>,
    next_tick: u64,
}

impl OrderTracker {
    fn touch(&mut self, key: &str) {
        if let Some(old) = self.ticks.get(key) {
            self.by_tick.remove(old);
        }
        let tick = self.next_tick;
        self.next_tick += 1;
        self.by_tick.insert(tick, key.to_string());
        self.ticks.insert(key.to_string(), tick);
    }

    fn remove(&mut self, key: &str) {
        if let Some(tick) = self.ticks.remove(key) {
            self.by_tick.remove(&tick);
        }
    }

    fn front(&self) -> Option<&String> {
        self.by_tick.values().next()
    }

    fn clear(&mut self) {
        self.by_tick.clear();
        self.ticks.clear();
    }
}

// ---------------------------------------------------------------------------
// LRU
// ---------------------------------------------------------------------------

/// Evicts the least recently accessed key.
#[derive(Debug, Default)]
pub struct LruStrategy {
    order: OrderTracker,
}

impl EvictionStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_add(&mut self, key: &str) {
        self.order.touch(key);
    }

    fn on_access(&mut self, key: &str) {
        self.order.touch(key);
    }

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn clear(&mut self) {
        self.order.clear();
    }

    fn select_victim(
        &self,
        entries: &mut dyn Iterator<Item = (&str, &EntryMeta)>,
    ) -> Option<String> {
        match self.order.front() {
            Some(key) => Some(key.clone()),
            // Order lost track of the entries; any key will do.
            None => entries.next().map(|(key, _)| key.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// LFU
// ---------------------------------------------------------------------------

/// Evicts the key with the fewest hits; ties go to the oldest insertion.
#[derive(Debug, Default, Clone, Copy)]
pub struct LfuStrategy;

impl EvictionStrategy for LfuStrategy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn on_add(&mut self, _key: &str) {}

    fn on_access(&mut self, _key: &str) {}

    fn on_remove(&mut self, _key: &str) {}

    fn clear(&mut self) {}

    fn select_victim(
        &self,
        entries: &mut dyn Iterator<Item = (&str, &EntryMeta)>,
    ) -> Option<String> {
        entries
            .min_by_key(|(_, meta)| (meta.hit_count, meta.inserted_at, meta.sequence))
            .map(|(key, _)| key.to_string())
    }
}

// ---------------------------------------------------------------------------
// FIFO
// ---------------------------------------------------------------------------

/// Evicts the oldest inserted key regardless of access.
#[derive(Debug, Default)]
pub struct FifoStrategy {
    order: OrderTracker,
}

impl EvictionStrategy for FifoStrategy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn on_add(&mut self, key: &str) {
        self.order.touch(key);
    }

    fn on_access(&mut self, _key: &str) {}

    fn on_remove(&mut self, key: &str) {
        self.order.remove(key);
    }

    fn clear(&mut self) {
        self.order.clear();
    }

    fn select_victim(
        &self,
        entries: &mut dyn Iterator<Item = (&str, &EntryMeta)>,
    ) -> Option<String> {
        match self.order.front() {
            Some(key) => Some(key.clone()),
            None => entries
                .min_by_key(|(_, meta)| (meta.inserted_at, meta.sequence))
                .map(|(key, _)| key.to_string()),
        }
    }
}
