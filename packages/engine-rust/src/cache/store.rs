//! Generic TTL cache with pluggable eviction.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::eviction::{strategy_for, EntryMeta, EvictionStrategy};
use crate::config::CacheConfig;

/// Size charged for values that cannot be serialized.
const UNSERIALIZABLE_ENTRY_BYTES: usize = 1024;

/// A stored value plus the bookkeeping that drives expiry and eviction.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub meta: EntryMeta,
    /// Entry-specific TTL; `None` falls back to the cache default.
    pub ttl: Option<Duration>,
    /// Estimated size in bytes.
    pub size: usize,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    /// Sum of estimated entry sizes. Informational only.
    pub memory_usage: usize,
}

/// Set of key patterns removed together by [`Cache::invalidate`].
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    patterns: Vec<Regex>,
}

impl InvalidationRule {
    /// Compiles the rule's patterns. A key matches when any pattern is found
    /// anywhere in it.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    fn matches(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(key))
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    strategy: Box<dyn EvictionStrategy>,
    hits: u64,
    misses: u64,
    hit_rate: f64,
    evictions: u64,
    expirations: u64,
    memory_usage: usize,
    next_sequence: u64,
}

impl<V> CacheInner<V> {
    fn is_expired(entry: &CacheEntry<V>, default_ttl: Duration, now: Instant) -> bool {
        let ttl = entry.ttl.unwrap_or(default_ttl);
        now.saturating_duration_since(entry.meta.inserted_at) > ttl
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.strategy.on_remove(key);
        self.memory_usage = self.memory_usage.saturating_sub(entry.size);
        Some(entry)
    }

    fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
            metrics::counter!("flatshard_cache_hits_total").increment(1);
        } else {
            self.misses += 1;
            metrics::counter!("flatshard_cache_misses_total").increment(1);
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / (self.hits + self.misses) as f64;
        self.hit_rate = rate;
    }

    fn evict_one(&mut self) {
        let victim = {
            let mut candidates = self.entries.iter().map(|(k, e)| (k.as_str(), &e.meta));
            self.strategy.select_victim(&mut candidates)
        };
        let Some(victim) = victim else { return };
        if self.remove(&victim).is_some() {
            self.evictions += 1;
            metrics::counter!("flatshard_cache_evictions_total").increment(1);
            debug!(key = %victim, strategy = self.strategy.name(), "evicted cache entry");
        } else {
            // Strategy named a key the map no longer holds; drop it from the
            // order and fall back to an arbitrary live key.
            self.strategy.on_remove(&victim);
            if let Some(any) = self.entries.keys().next().cloned() {
                self.remove(&any);
                self.evictions += 1;
            }
        }
    }
}

/// Thread-safe key-value cache with per-entry TTL and count-bounded eviction.
///
/// Expiry is lazy: `get` and `has` treat an entry older than its TTL as
/// absent and drop it. [`Cache::cleanup_expired`] sweeps everything at once
/// and is what the background sweeper calls.
pub struct Cache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    default_ttl: Duration,
}

impl<V: Clone + Serialize> Cache<V> {
    /// Creates a cache holding at most `max_size` entries (minimum 1).
    #[must_use]
    pub fn new(max_size: usize, default_ttl: Duration, strategy: Box<dyn EvictionStrategy>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                strategy,
                hits: 0,
                misses: 0,
                hit_rate: 0.0,
                evictions: 0,
                expirations: 0,
                memory_usage: 0,
                next_sequence: 0,
            }),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    #[must_use]
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.ttl, strategy_for(config.strategy))
    }

    /// Returns a clone of the live value, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.record_lookup(false);
                return None;
            }
            Some(entry) => CacheInner::is_expired(entry, self.default_ttl, now),
        };
        if expired {
            inner.remove(key);
            inner.expirations += 1;
            inner.record_lookup(false);
            return None;
        }

        let value = inner.entries.get_mut(key).map(|entry| {
            entry.meta.hit_count += 1;
            entry.meta.last_access = now;
            entry.value.clone()
        });
        inner.strategy.on_access(key);
        inner.record_lookup(true);
        value
    }

    /// Stores a value, evicting one victim first when inserting a new key
    /// into a full cache.
    ///
    /// Overwriting a key that is already present never evicts, even when
    /// the cache is full: the entry count does not grow.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        let key = key.into();
        let size = flatshard_core::estimate_size(&value, UNSERIALIZABLE_ENTRY_BYTES);
        let mut inner = self.inner.lock();

        if inner.remove(&key).is_none() && inner.entries.len() >= self.max_size {
            inner.evict_one();
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                meta: EntryMeta::new(Instant::now()).with_sequence(sequence),
                ttl,
                size,
            },
        );
        inner.memory_usage += size;
        inner.strategy.on_add(&key);
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            None => return false,
            Some(entry) => CacheInner::is_expired(entry, self.default_ttl, now),
        };
        if expired {
            inner.remove(key);
            inner.expirations += 1;
            return false;
        }
        true
    }

    /// Removes a key, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Drops every entry. Statistics counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.strategy.clear();
        inner.memory_usage = 0;
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Deletes every key matching any pattern of any rule.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, rules: &[InvalidationRule]) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for rule in rules {
            let doomed: Vec<String> = inner
                .entries
                .keys()
                .filter(|key| rule.matches(key))
                .cloned()
                .collect();
            for key in doomed {
                if inner.remove(&key).is_some() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            debug!(removed, "invalidated cache entries");
        }
        removed
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| CacheInner::is_expired(entry, self.default_ttl, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        inner.expirations += expired.len() as u64;
        expired.len()
    }

    /// Snapshot of the current keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.lock().memory_usage
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: inner.hit_rate,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.entries.len(),
            memory_usage: inner.memory_usage,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}
