//! Caching layer — an in-memory TTL/LRU hybrid cache for upstream responses.
//!
//! [`Cache`] maps string keys to cloned values. Entries expire lazily on read
//! and through an opportunistic sweep that piggybacks on [`Cache::get`]. When
//! the cache is full, inserting a new key evicts exactly one entry chosen by
//! the configured [`EvictionStrategy`].
//!
//! Cache operations never fail: a poisoned lock is recovered, and a scoring
//! problem during eviction degrades to evicting an arbitrary entry. The cache
//! must never be the reason a tool call fails.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use hostgate::cache::{Cache, CacheConfig, EvictionStrategy};
//!
//! let cache = Cache::new(CacheConfig {
//!     max_size: 2,
//!     strategy: EvictionStrategy::Lru,
//!     ..CacheConfig::default()
//! });
//! cache.set("a", 1);
//! cache.set("b", 2);
//! assert_eq!(cache.get("a"), Some(1));
//! assert_eq!(cache.invalidate_pattern("*"), 2);
//! assert!(cache.is_empty());
//! ```

mod aside;
mod entry;
mod pattern;

pub use aside::cached;
pub use entry::{CacheEntry, EvictionStrategy, Ttl};
pub use pattern::Glob;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::MetricsCollector;

/// Construction options for [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of live entries.
    pub max_size: usize,
    /// TTL applied by [`Cache::set`] and [`Ttl::Default`]. `None` means no expiry.
    pub default_ttl: Option<Duration>,
    pub strategy: EvictionStrategy,
    /// Minimum time between two expiry sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Some(Duration::from_secs(300)),
            strategy: EvictionStrategy::Both,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Read-only statistics derived from a cache's counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub size: usize,
    pub capacity: usize,
    /// Hits as a percentage of all reads; `0.0` before the first read.
    pub hit_rate: f64,
    /// Size as a percentage of capacity.
    pub utilization: f64,
}

// Reasons an eviction score could not be computed.
#[derive(Debug, Error)]
enum ScoreError {
    #[error("entry {0} was touched after the eviction clock")]
    ClockSkew(String),
    #[error("entry {0} produced a non-finite score")]
    NonFinite(String),
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    last_sweep: Instant,
    tick: u64,
}

impl<V> CacheState<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

enum Lookup<V> {
    Hit(V),
    Expired,
    Missing,
}

/// Thread-safe TTL/LRU cache.
///
/// A single mutex guards the entry map; hit, miss, eviction and invalidation
/// tallies are atomics so [`Cache::metrics`] reads them without the lock.
/// Values are cloned out, so callers never observe later writes.
pub struct Cache<V> {
    name: String,
    config: CacheConfig,
    state: Mutex<CacheState<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<V: Clone> Cache<V> {
    /// Creates an empty cache that reports to no collector.
    ///
    /// # Examples
    ///
    /// ```
    /// use hostgate::cache::{Cache, CacheConfig};
    ///
    /// let cache = Cache::new(CacheConfig { max_size: 2, ..CacheConfig::default() });
    /// cache.set("a", 1);
    /// cache.set("b", 2);
    /// cache.set("c", 3);
    ///
    /// assert_eq!(cache.len(), 2);
    /// assert_eq!(cache.get("c"), Some(3));
    /// ```
    pub fn new(config: CacheConfig) -> Self {
        Self {
            name: "default".to_owned(),
            config,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Reports hits, misses, evictions and size to `metrics`, labelled `cache=<name>`.
    #[must_use]
    pub fn with_metrics(mut self, name: impl Into<String>, metrics: Arc<MetricsCollector>) -> Self {
        self.name = name.into();
        self.metrics = Some(metrics);
        self
    }

    /// Options this cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the value under `key` if present and not expired.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.lock();
        let swept = self.sweep_if_due(&mut state, now);

        let tick = state.next_tick();
        let lookup = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_access(now, tick);
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Missing,
        };

        match lookup {
            Lookup::Hit(value) => {
                let size = state.entries.len();
                drop(state);
                if swept > 0 {
                    self.report_size(size);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.report_counter("cache_hits_total", 1);
                Some(value)
            }
            Lookup::Expired => {
                state.entries.remove(key);
                let size = state.entries.len();
                drop(state);
                debug!(cache = %self.name, key, "expired on read");
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.record_miss();
                self.report_size(size);
                None
            }
            Lookup::Missing => {
                let size = state.entries.len();
                drop(state);
                if swept > 0 {
                    self.report_size(size);
                }
                self.record_miss();
                None
            }
        }
    }

    /// Inserts or overwrites `key` with the default TTL and no tags.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with(key, value, Ttl::Default, &[]);
    }

    /// Inserts or overwrites `key`.
    ///
    /// Inserting a new key into a full cache first evicts one entry.
    pub fn set_with(&self, key: impl Into<String>, value: V, ttl: impl Into<Ttl>, tags: &[&str]) {
        if self.config.max_size == 0 {
            return;
        }

        let key = key.into();
        let ttl = match ttl.into() {
            Ttl::Default => self.config.default_ttl,
            Ttl::Never => None,
            Ttl::After(ttl) => Some(ttl),
        };
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_owned()).collect();
        let now = Instant::now();

        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.overwrite(value, ttl, tags, now);
            return;
        }

        let mut evicted = None;
        if state.entries.len() >= self.config.max_size {
            if let Some(victim) = self.select_victim(&state.entries, now) {
                state.entries.remove(&victim);
                evicted = Some(victim);
            }
        }

        let tick = state.next_tick();
        state
            .entries
            .insert(key.clone(), CacheEntry::new(key, value, ttl, tags, now, tick));
        let size = state.entries.len();
        drop(state);

        if let Some(victim) = evicted {
            debug!(cache = %self.name, key = %victim, strategy = %self.config.strategy, "evicted");
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.report_counter("cache_evictions_total", 1);
        }
        self.report_size(size);
    }

    /// Refreshes the recency of `key` without reading it. Returns `false` when
    /// the key is absent or expired.
    pub fn touch(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.lock();
        let tick = state.next_tick();
        match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.record_access(now, tick);
                true
            }
            _ => false,
        }
    }

    /// Whether a live entry exists for `key`. Not counted as a read.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Removes `key`. Returns whether an entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.lock();
        let removed = state.entries.remove(key).is_some();
        let size = state.entries.len();
        drop(state);
        if removed {
            self.report_size(size);
        }
        removed
    }

    /// Removes every key matching the shell-style `pattern`. Returns the count.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let glob = Glob::new(pattern);
        let removed = self.remove_where(|key, _| glob.matches(key));
        if removed > 0 {
            debug!(cache = %self.name, pattern, removed, "invalidated by pattern");
        }
        removed
    }

    /// Removes every entry tagged with one of `tags`, and every key matching
    /// the derived pattern `*<tag>*`. Returns the count.
    pub fn invalidate_tags(&self, tags: &[&str]) -> usize {
        if tags.is_empty() {
            return 0;
        }
        let globs: Vec<Glob> = tags.iter().map(|tag| Glob::new(&format!("*{tag}*"))).collect();
        let removed = self.remove_where(|key, entry| {
            tags.iter().any(|tag| entry.has_tag(tag)) || globs.iter().any(|g| g.matches(key))
        });
        if removed > 0 {
            debug!(cache = %self.name, ?tags, removed, "invalidated by tags");
        }
        removed
    }

    fn remove_where(&self, mut predicate: impl FnMut(&str, &CacheEntry<V>) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|key, entry| !predicate(key, entry));
        let size = state.entries.len();
        drop(state);

        let removed = before - size;
        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            self.report_counter("cache_invalidations_total", removed as u64);
            self.report_size(size);
        }
        removed
    }

    /// Removes all entries. Statistics are kept.
    pub fn clear(&self) {
        self.lock().entries.clear();
        self.report_size(0);
    }

    /// Drops every expired entry now. Returns the count.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let removed = self.purge_locked(&mut state, now);
        let size = state.entries.len();
        drop(state);
        if removed > 0 {
            self.report_size(size);
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hit/miss counters and current occupancy.
    pub fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let size = self.len();
        let capacity = self.config.max_size;
        let reads = hits + misses;

        CacheMetrics {
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size,
            capacity,
            hit_rate: if reads == 0 {
                0.0
            } else {
                hits as f64 / reads as f64 * 100.0
            },
            utilization: if capacity == 0 {
                0.0
            } else {
                size as f64 / capacity as f64 * 100.0
            },
        }
    }

    // Purges expired entries once per sweep interval. Returns the count.
    fn sweep_if_due(&self, state: &mut CacheState<V>, now: Instant) -> usize {
        if now.saturating_duration_since(state.last_sweep) < self.config.sweep_interval {
            return 0;
        }
        state.last_sweep = now;
        let removed = self.purge_locked(state, now);
        if removed > 0 {
            debug!(cache = %self.name, removed, "swept expired entries");
        }
        removed
    }

    fn purge_locked(&self, state: &mut CacheState<V>, now: Instant) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - state.entries.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    // Picks the entry to evict. Falls back to an arbitrary key if scoring fails.
    fn select_victim(&self, entries: &HashMap<String, CacheEntry<V>>, now: Instant) -> Option<String> {
        match score_victim(self.config.strategy, entries, now) {
            Ok(victim) => victim,
            Err(e) => {
                warn!(cache = %self.name, error = %e, "eviction scoring failed, evicting arbitrary entry");
                entries.keys().next().cloned()
            }
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.report_counter("cache_misses_total", 1);
    }

    fn report_counter(&self, name: &str, delta: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, &[("cache", &self.name)], delta);
        }
    }

    fn report_size(&self, size: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge("cache_entries", size as f64, &[("cache", &self.name)]);
        }
    }
}

fn least_recent<V>(entries: &HashMap<String, CacheEntry<V>>) -> Option<String> {
    entries
        .values()
        .min_by_key(|e| (e.last_accessed_at, e.tick))
        .map(|e| e.key.clone())
}

fn score_victim<V>(
    strategy: EvictionStrategy,
    entries: &HashMap<String, CacheEntry<V>>,
    now: Instant,
) -> Result<Option<String>, ScoreError> {
    match strategy {
        EvictionStrategy::Lru => Ok(least_recent(entries)),
        EvictionStrategy::Ttl => {
            let soonest = entries
                .values()
                .filter_map(|e| e.expires_at().map(|at| (at, e.tick, &e.key)))
                .min();
            match soonest {
                Some((_, _, key)) => Ok(Some(key.clone())),
                None => Ok(least_recent(entries)),
            }
        }
        EvictionStrategy::Both => {
            let mut best: Option<(f64, u64, &String)> = None;
            for entry in entries.values() {
                let idle = now
                    .checked_duration_since(entry.last_accessed_at)
                    .ok_or_else(|| ScoreError::ClockSkew(entry.key.clone()))?;
                let age = now
                    .checked_duration_since(entry.created_at)
                    .ok_or_else(|| ScoreError::ClockSkew(entry.key.clone()))?;
                let score = idle.as_secs_f64() + 0.1 * age.as_secs_f64();
                if !score.is_finite() {
                    return Err(ScoreError::NonFinite(entry.key.clone()));
                }
                // Highest score wins; equal scores go to the older access.
                let better = match best {
                    None => true,
                    Some((s, tick, _)) => score > s || (score == s && entry.tick < tick),
                };
                if better {
                    best = Some((score, entry.tick, &entry.key));
                }
            }
            Ok(best.map(|(_, _, key)| key.clone()))
        }
    }
}
