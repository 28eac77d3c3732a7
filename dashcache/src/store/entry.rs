// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cache keys, entries and write options

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{CacheError, CacheResult};

/// Identity of a cache entry: a key inside a namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.namespace.is_empty() {
            return Err(CacheError::invalid("namespace must not be empty"));
        }
        if self.key.is_empty() {
            return Err(CacheError::invalid("key must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.key)
    }
}

/// Refresh and retention priority. `Critical` entries are pinned against
/// LRU and pressure eviction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Important,
    Critical,
}

impl Priority {
    pub fn is_pinned(&self) -> bool {
        matches!(self, Priority::Critical)
    }
}

/// Where the current value of an entry came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntrySource {
    #[default]
    Explicit,
    Loader,
    Refresh,
    Remote,
    Backing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub source: EntrySource,
    pub prefetched: bool,
}

/// Last-write-wins stamp. Ordered by timestamp, ties broken by origin id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteStamp {
    pub timestamp: u64,
    pub origin: Uuid,
}

impl WriteStamp {
    pub fn new(timestamp: u64, origin: Uuid) -> Self {
        Self { timestamp, origin }
    }
}

/// Caller options for a write
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Explicit TTL; when absent the manager asks the TTL engine
    pub ttl: Option<Duration>,
    /// Data type used by the TTL engine
    pub data_type: Option<String>,
    pub dependencies: Vec<CacheKey>,
    pub priority: Priority,
    pub prefetched: bool,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn depends_on(mut self, dependency: CacheKey) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn prefetched(mut self, prefetched: bool) -> Self {
        self.prefetched = prefetched;
        self
    }
}

/// Immutable snapshot of a stored entry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Stored bytes (compressed when `compressed`)
    pub value: Arc<[u8]>,
    pub compressed: bool,
    pub original_size: usize,
    pub compression_ratio: Option<f32>,
    pub created_at: u64,
    pub expires_at: u64,
    pub ttl_ms: u64,
    pub last_accessed_at: u64,
    pub access_count: u64,
    pub size_bytes: usize,
    pub dependencies: BTreeSet<CacheKey>,
    pub priority: Priority,
    pub metadata: EntryMetadata,
    pub version: u64,
    pub stamp: WriteStamp,
    pub checksum: u32,
    pub refresh_error: Option<String>,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Entry as held by the store. Access bookkeeping is atomic so reads only
/// need a shared lock on the map.
#[derive(Debug)]
pub(crate) struct StoredEntry {
    pub key: CacheKey,
    pub value: Arc<[u8]>,
    pub compressed: bool,
    pub original_size: usize,
    pub compression_ratio: Option<f32>,
    pub created_at: u64,
    pub expires_at: u64,
    pub ttl_ms: u64,
    pub last_accessed_at: AtomicU64,
    pub access_count: AtomicU64,
    pub lru_tick: AtomicU64,
    pub dependencies: BTreeSet<CacheKey>,
    pub priority: Priority,
    pub metadata: EntryMetadata,
    pub version: u64,
    pub stamp: WriteStamp,
    pub checksum: u32,
    pub refresh_error: Option<String>,
}

impl StoredEntry {
    pub fn size_bytes(&self) -> usize {
        self.value.len()
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at
    }

    pub fn touch(&self, now: u64, tick: u64) {
        self.last_accessed_at.store(now, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.lru_tick.store(tick, Ordering::Relaxed);
    }

    pub fn tick(&self) -> u64 {
        self.lru_tick.load(Ordering::Relaxed)
    }

    /// Copy with a replacement dependency set; bookkeeping carries over
    pub fn with_dependencies(&self, dependencies: BTreeSet<CacheKey>) -> Self {
        let mut copy = self.duplicate();
        copy.dependencies = dependencies;
        copy
    }

    /// Copy with a refresh error flag set or cleared
    pub fn with_refresh_error(&self, error: Option<String>) -> Self {
        let mut copy = self.duplicate();
        copy.refresh_error = error;
        copy
    }

    fn duplicate(&self) -> Self {
        Self {
            key: self.key.clone(),
            value: self.value.clone(),
            compressed: self.compressed,
            original_size: self.original_size,
            compression_ratio: self.compression_ratio,
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl_ms: self.ttl_ms,
            last_accessed_at: AtomicU64::new(self.last_accessed_at.load(Ordering::Relaxed)),
            access_count: AtomicU64::new(self.access_count.load(Ordering::Relaxed)),
            lru_tick: AtomicU64::new(self.tick()),
            dependencies: self.dependencies.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
            version: self.version,
            stamp: self.stamp,
            checksum: self.checksum,
            refresh_error: self.refresh_error.clone(),
        }
    }

    pub fn snapshot(&self) -> CacheEntry {
        CacheEntry {
            key: self.key.clone(),
            value: self.value.clone(),
            compressed: self.compressed,
            original_size: self.original_size,
            compression_ratio: self.compression_ratio,
            created_at: self.created_at,
            expires_at: self.expires_at,
            ttl_ms: self.ttl_ms,
            last_accessed_at: self.last_accessed_at.load(Ordering::Relaxed),
            access_count: self.access_count.load(Ordering::Relaxed),
            size_bytes: self.size_bytes(),
            dependencies: self.dependencies.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
            version: self.version,
            stamp: self.stamp,
            checksum: self.checksum,
            refresh_error: self.refresh_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_stamp_ties_broken_by_origin() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        assert!(WriteStamp::new(100, b) > WriteStamp::new(100, a));
        assert!(WriteStamp::new(101, a) > WriteStamp::new(100, b));
    }

    #[test]
    fn test_priority_ordering_and_pinning() {
        assert!(Priority::Critical > Priority::Important);
        assert!(Priority::Important > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert!(Priority::Critical.is_pinned());
        assert!(!Priority::Important.is_pinned());
    }

    #[test]
    fn test_key_validation() {
        assert!(CacheKey::new("dashboard", "stats").validate().is_ok());
        assert!(CacheKey::new("", "stats").validate().is_err());
        assert!(CacheKey::new("dashboard", "").validate().is_err());
        assert_eq!(CacheKey::new("dashboard", "stats").to_string(), "dashboard:stats");
    }
}
