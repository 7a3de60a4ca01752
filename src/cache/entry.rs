//! Cache entries and the eviction strategy selector.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// How a full cache picks the entry to drop when a new key arrives.
///
/// Chosen once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStrategy {
    /// Evict the entry accessed longest ago.
    Lru,
    /// Evict the entry closest to expiry. Entries without a TTL are never
    /// chosen by this rule; if no entry has a TTL, recency breaks the tie.
    Ttl,
    /// Evict the maximum of `idle + 0.1 * age`, in seconds.
    #[default]
    Both,
}

impl EvictionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Ttl => "ttl",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for EvictionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "ttl" => Ok(Self::Ttl),
            "both" | "hybrid" => Ok(Self::Both),
            other => Err(format!("unknown eviction strategy: {other}")),
        }
    }
}

/// Expiry requested on a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ttl {
    /// Use the cache's configured default TTL.
    #[default]
    Default,
    /// Never expire by time.
    Never,
    /// Expire after the given duration.
    After(Duration),
}

impl From<Duration> for Ttl {
    fn from(ttl: Duration) -> Self {
        Self::After(ttl)
    }
}

/// A value held by the cache together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: Instant,
    pub last_accessed_at: Instant,
    pub ttl: Option<Duration>,
    pub access_count: u64,
    pub tags: Vec<String>,
    // Logical clock of the last access; orders entries that share an instant.
    pub(crate) tick: u64,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(
        key: String,
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
        now: Instant,
        tick: u64,
    ) -> Self {
        Self {
            key,
            value,
            created_at: now,
            last_accessed_at: now,
            ttl,
            access_count: 0,
            tags,
            tick,
        }
    }

    /// An entry with TTL `T` is live for elapsed times `< T`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.created_at) >= ttl,
            None => false,
        }
    }

    /// Instant at which the entry expires, or `None` if it never does.
    pub fn expires_at(&self) -> Option<Instant> {
        self.ttl.and_then(|ttl| self.created_at.checked_add(ttl))
    }

    pub(crate) fn record_access(&mut self, now: Instant, tick: u64) {
        self.last_accessed_at = now;
        self.access_count += 1;
        self.tick = tick;
    }

    pub(crate) fn overwrite(&mut self, value: V, ttl: Option<Duration>, tags: Vec<String>, now: Instant) {
        self.value = value;
        self.created_at = now;
        self.ttl = ttl;
        self.tags = tags;
    }

    pub(crate) fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
