// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Key/namespace entry store with LRU eviction and compression
//!
//! Entries live behind `Arc`s in a single map guarded by a `RwLock`.
//! Reads take the shared lock just long enough to clone the entry handle,
//! then decode outside the lock; access counters are atomics. Structural
//! mutations (insert, evict, delete) take the exclusive lock and are
//! therefore serialized with respect to each other. A reader that already
//! holds an entry handle keeps its bytes alive even if the entry is evicted.

pub mod backing;
pub mod compression;
pub mod entry;
mod lru;

pub use backing::{BackingStore, MemoryBackingStore};
pub use compression::CompressionProfile;
pub use entry::{
    CacheEntry, CacheKey, EntryMetadata, EntrySource, Priority, SetOptions, WriteStamp,
};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::clock::SharedClock;
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{SubscriptionId, Subscribers};
use entry::StoredEntry;
use lru::{all_evictable, evictable_bytes, plan_eviction};

/// Result of a read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    pub hit: bool,
    /// Served past its expiry under stale-while-revalidate
    pub stale: bool,
    /// Decoded (uncompressed) bytes
    pub value: Option<Arc<[u8]>>,
    /// Last background refresh failure for this entry, if any
    pub error: Option<String>,
    pub version: Option<u64>,
    pub ttl: Option<Duration>,
    /// Time left before expiry (zero when stale)
    pub remaining: Option<Duration>,
    /// Set when the read removed the entry (expired or corrupt)
    pub purged: Option<RemovalReason>,
}

impl CacheLookup {
    fn miss() -> Self {
        Self::default()
    }

    fn purged(reason: RemovalReason) -> Self {
        Self {
            purged: Some(reason),
            ..Self::default()
        }
    }
}

/// Why entries left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    Deleted,
    Invalidated,
    Evicted,
    Pressure,
    Expired,
    Corrupt,
    Remote,
    Cleared,
}

/// Notification delivered after entries are removed
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRemoval {
    pub keys: Vec<CacheKey>,
    pub reason: RemovalReason,
}

/// Guard evaluated under the write lock before a write is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteCondition {
    Always,
    /// Only if the entry's current version equals the given one (`None` = absent)
    IfVersion(Option<u64>),
    /// Only if the write stamp is newer than the stored one
    IfNewerStamp,
}

/// A fully resolved write
#[derive(Debug, Clone)]
pub(crate) struct WriteRequest {
    pub key: CacheKey,
    pub raw: Vec<u8>,
    pub ttl: Duration,
    pub dependencies: BTreeSet<CacheKey>,
    pub priority: Priority,
    pub metadata: EntryMetadata,
    pub stamp: WriteStamp,
    pub condition: WriteCondition,
    /// Keep creation time, access history, dependencies and priority of an
    /// existing entry (background refresh)
    pub preserve_identity: bool,
}

/// What a successful write did
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReport {
    pub version: u64,
    pub size_bytes: usize,
    pub original_size: usize,
    pub compressed: bool,
    pub compression_ratio: Option<f32>,
    pub replaced: bool,
    pub evicted: Vec<CacheKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WriteOutcome {
    Written(WriteReport),
    /// The write condition did not hold; nothing changed
    Discarded,
}

/// Entries removed by a bulk eviction pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionReport {
    pub keys: Vec<CacheKey>,
    pub bytes_freed: usize,
}

/// Store counters
#[derive(Debug, Default)]
struct StoreStats {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    rejected_writes: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corrupt_purges: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct StoreStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub rejected_writes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corrupt_purges: u64,
    pub entry_count: usize,
    pub used_bytes: usize,
    pub max_memory_bytes: usize,
}

impl StoreStatsSnapshot {
    pub fn total_requests(&self) -> u64 {
        self.hits + self.stale_hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.hits + self.stale_hits) as f64 / total as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

/// Consistency digest of one live entry
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EntryDigest {
    pub key: CacheKey,
    pub stamp: WriteStamp,
    pub checksum: u32,
}

/// Bounded key/namespace entry store
pub struct CacheStore {
    entries: RwLock<HashMap<CacheKey, Arc<StoredEntry>>>,
    used_bytes: AtomicUsize,
    max_memory_bytes: usize,
    max_entries: usize,
    max_entry_bytes: usize,
    serve_stale: bool,
    stale_grace_ms: u64,
    compression: RwLock<CompressionProfile>,
    clock: SharedClock,
    next_version: AtomicU64,
    next_tick: AtomicU64,
    stats: StoreStats,
    removals: Subscribers<StoreRemoval>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            used_bytes: AtomicUsize::new(0),
            max_memory_bytes: config.max_memory_bytes,
            max_entries: config.max_entries,
            max_entry_bytes: config.max_entry_bytes,
            serve_stale: config.serve_stale,
            stale_grace_ms: config.stale_grace.as_millis() as u64,
            compression: RwLock::new(CompressionProfile {
                enabled: config.compression.enabled,
                threshold_bytes: config.compression.threshold_bytes,
                level: config.compression.level,
            }),
            clock,
            next_version: AtomicU64::new(0),
            next_tick: AtomicU64::new(0),
            stats: StoreStats::default(),
            removals: Subscribers::new(),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Look up an entry, updating its LRU position and access counters
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let now = self.clock.now_millis();
        let entry = self.entries.read().get(key).cloned();

        let Some(entry) = entry else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return CacheLookup::miss();
        };

        let stale = entry.is_expired_at(now);
        if stale && !self.stale_servable(&entry, now) {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            self.stats.expirations.fetch_add(1, Ordering::Relaxed);
            self.remove_if_version(key, entry.version, RemovalReason::Expired);
            log::debug!("Cache entry {} expired", key);
            return CacheLookup::purged(RemovalReason::Expired);
        }

        let value = match self.decode(&entry) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Purging corrupt cache entry {}: {}", key, e);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.corrupt_purges.fetch_add(1, Ordering::Relaxed);
                self.remove_if_version(key, entry.version, RemovalReason::Corrupt);
                return CacheLookup::purged(RemovalReason::Corrupt);
            }
        };

        entry.touch(now, self.next_tick());
        if stale {
            self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }

        CacheLookup {
            hit: true,
            stale,
            value: Some(value),
            error: entry.refresh_error.clone(),
            version: Some(entry.version),
            ttl: Some(Duration::from_millis(entry.ttl_ms)),
            remaining: Some(Duration::from_millis(entry.expires_at.saturating_sub(now))),
            purged: None,
        }
    }

    /// Snapshot of an entry without touching LRU or counters
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().get(key).map(|entry| entry.snapshot())
    }

    /// Decoded value and snapshot without touching LRU or counters
    pub fn read_raw(&self, key: &CacheKey) -> Option<(Vec<u8>, CacheEntry)> {
        let entry = self.entries.read().get(key).cloned()?;
        match self.decode(&entry) {
            Ok(value) => Some((value.to_vec(), entry.snapshot())),
            Err(e) => {
                log::warn!("Cannot read raw value of {}: {}", key, e);
                None
            }
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// True when the entry exists and is fresh or still servable stale
    pub fn is_live(&self, key: &CacheKey) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .read()
            .get(key)
            .map(|entry| !entry.is_expired_at(now) || self.stale_servable(entry, now))
            .unwrap_or(false)
    }

    pub fn version_of(&self, key: &CacheKey) -> Option<u64> {
        self.entries.read().get(key).map(|entry| entry.version)
    }

    pub fn stamp_of(&self, key: &CacheKey) -> Option<WriteStamp> {
        self.entries.read().get(key).map(|entry| entry.stamp)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::SeqCst)
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_bytes
    }

    /// usedBytes / maxBytes
    pub fn pressure(&self) -> f64 {
        self.used_bytes() as f64 / self.max_memory_bytes as f64
    }

    pub fn compression_profile(&self) -> CompressionProfile {
        *self.compression.read()
    }

    /// Applies to subsequent writes only
    pub fn set_compression_profile(&self, profile: CompressionProfile) {
        *self.compression.write() = profile;
    }

    pub fn on_removal<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StoreRemoval) + Send + Sync + 'static,
    {
        self.removals.subscribe(handler)
    }

    pub(crate) fn write(&self, request: WriteRequest) -> CacheResult<WriteOutcome> {
        request.key.validate()?;
        if request.ttl.is_zero() {
            return Err(CacheError::invalid("ttl must be greater than zero"));
        }

        let original_size = request.raw.len();
        if original_size > self.max_entry_bytes {
            self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::EntryTooLarge {
                size: original_size,
                limit: self.max_entry_bytes,
            });
        }

        let checksum = crc32fast::hash(&request.raw);
        let profile = self.compression_profile();
        let encoded = compression::encode(request.raw, &profile);
        let size = encoded.bytes.len();
        if size > self.max_memory_bytes {
            self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::EntryTooLarge {
                size,
                limit: self.max_memory_bytes,
            });
        }

        let key = request.key;
        let now = self.clock.now_millis();
        let ttl_ms = request.ttl.as_millis() as u64;

        let (report, evicted) = {
            let mut entries = self.entries.write();
            let existing = entries.get(&key).cloned();

            let allowed = match request.condition {
                WriteCondition::Always => true,
                WriteCondition::IfVersion(expected) => {
                    existing.as_ref().map(|entry| entry.version) == expected
                }
                WriteCondition::IfNewerStamp => existing
                    .as_ref()
                    .map(|entry| request.stamp > entry.stamp)
                    .unwrap_or(true),
            };
            if !allowed {
                return Ok(WriteOutcome::Discarded);
            }

            let existing_size = existing.as_ref().map(|e| e.size_bytes()).unwrap_or(0);
            let used_without = self.used_bytes().saturating_sub(existing_size);
            let count_without = entries.len() - usize::from(existing.is_some());
            let bytes_needed = (used_without + size).saturating_sub(self.max_memory_bytes);
            let entries_needed = (count_without + 1).saturating_sub(self.max_entries);

            let plan = plan_eviction(entries.values(), Some(&key), |bytes, count| {
                bytes >= bytes_needed && count >= entries_needed
            });
            let Some(plan) = plan else {
                self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::InsufficientCapacity {
                    needed: bytes_needed,
                    available: evictable_bytes(entries.values(), Some(&key)),
                });
            };

            for victim in &plan.victims {
                if let Some(evicted) = entries.remove(victim) {
                    self.used_bytes
                        .fetch_sub(evicted.size_bytes(), Ordering::SeqCst);
                }
            }

            let carried = existing.as_ref().filter(|_| request.preserve_identity);
            let version = self.next_version.fetch_add(1, Ordering::SeqCst) + 1;
            let stored = StoredEntry {
                key: key.clone(),
                value: encoded.bytes.into(),
                compressed: encoded.compressed,
                original_size,
                compression_ratio: encoded.ratio,
                created_at: carried.map(|e| e.created_at).unwrap_or(now),
                expires_at: now.saturating_add(ttl_ms),
                ttl_ms,
                last_accessed_at: AtomicU64::new(
                    carried
                        .map(|e| e.last_accessed_at.load(Ordering::Relaxed))
                        .unwrap_or(now),
                ),
                access_count: AtomicU64::new(
                    carried
                        .map(|e| e.access_count.load(Ordering::Relaxed))
                        .unwrap_or(0),
                ),
                lru_tick: AtomicU64::new(match carried {
                    Some(e) => e.tick(),
                    None => self.next_tick(),
                }),
                dependencies: carried
                    .map(|e| e.dependencies.clone())
                    .unwrap_or(request.dependencies),
                priority: carried.map(|e| e.priority).unwrap_or(request.priority),
                metadata: EntryMetadata {
                    source: request.metadata.source,
                    prefetched: carried
                        .map(|e| e.metadata.prefetched)
                        .unwrap_or(request.metadata.prefetched),
                },
                version,
                stamp: request.stamp,
                checksum,
                refresh_error: None,
            };

            self.used_bytes.fetch_sub(existing_size, Ordering::SeqCst);
            self.used_bytes.fetch_add(size, Ordering::SeqCst);
            entries.insert(key.clone(), Arc::new(stored));

            let report = WriteReport {
                version,
                size_bytes: size,
                original_size,
                compressed: encoded.compressed,
                compression_ratio: encoded.ratio,
                replaced: existing.is_some(),
                evicted: plan.victims.clone(),
            };
            (report, plan.victims)
        };

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        if !evicted.is_empty() {
            self.stats
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            log::debug!("Evicted {} entries to fit {}", evicted.len(), key);
            self.removals.notify(&StoreRemoval {
                keys: evicted,
                reason: RemovalReason::Evicted,
            });
        }

        Ok(WriteOutcome::Written(report))
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey, reason: RemovalReason) -> Option<CacheEntry> {
        let removed = {
            let mut entries = self.entries.write();
            let removed = entries.remove(key);
            if let Some(entry) = &removed {
                self.used_bytes
                    .fetch_sub(entry.size_bytes(), Ordering::SeqCst);
            }
            removed
        };

        removed.map(|entry| {
            self.removals.notify(&StoreRemoval {
                keys: vec![key.clone()],
                reason,
            });
            entry.snapshot()
        })
    }

    /// Remove only if the entry has not been rewritten since `version`
    pub fn remove_if_version(&self, key: &CacheKey, version: u64, reason: RemovalReason) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            match entries.get(key) {
                Some(entry) if entry.version == version => {
                    self.used_bytes
                        .fetch_sub(entry.size_bytes(), Ordering::SeqCst);
                    entries.remove(key);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.removals.notify(&StoreRemoval {
                keys: vec![key.clone()],
                reason,
            });
        }
        removed
    }

    /// Evict LRU entries (pinned excluded) until `used_bytes < target_bytes`
    pub fn evict_below(&self, target_bytes: usize, reason: RemovalReason) -> EvictionReport {
        let report = {
            let mut entries = self.entries.write();
            let used = self.used_bytes();
            if used < target_bytes {
                return EvictionReport::default();
            }
            let must_free = used - target_bytes + 1;

            // Unreachable target: evict everything evictable
            let plan = plan_eviction(entries.values(), None, |bytes, _| bytes >= must_free)
                .unwrap_or_else(|| all_evictable(entries.values()));

            let mut report = EvictionReport::default();
            for victim in plan.victims {
                if let Some(entry) = entries.remove(&victim) {
                    self.used_bytes
                        .fetch_sub(entry.size_bytes(), Ordering::SeqCst);
                    report.bytes_freed += entry.size_bytes();
                    report.keys.push(victim);
                }
            }
            report
        };

        if !report.keys.is_empty() {
            self.stats
                .evictions
                .fetch_add(report.keys.len() as u64, Ordering::Relaxed);
            self.removals.notify(&StoreRemoval {
                keys: report.keys.clone(),
                reason,
            });
        }
        report
    }

    /// Drop entries that can no longer be served, even stale
    pub fn purge_expired(&self) -> EvictionReport {
        let now = self.clock.now_millis();
        let report = {
            let mut entries = self.entries.write();
            let expired: Vec<CacheKey> = entries
                .values()
                .filter(|entry| entry.is_expired_at(now) && !self.stale_servable(entry, now))
                .map(|entry| entry.key.clone())
                .collect();

            let mut report = EvictionReport::default();
            for key in expired {
                if let Some(entry) = entries.remove(&key) {
                    self.used_bytes
                        .fetch_sub(entry.size_bytes(), Ordering::SeqCst);
                    report.bytes_freed += entry.size_bytes();
                    report.keys.push(key);
                }
            }
            report
        };

        if !report.keys.is_empty() {
            self.stats
                .expirations
                .fetch_add(report.keys.len() as u64, Ordering::Relaxed);
            self.removals.notify(&StoreRemoval {
                keys: report.keys.clone(),
                reason: RemovalReason::Expired,
            });
        }
        report
    }

    /// Replace the dependency set recorded on an entry
    pub fn set_dependencies(&self, key: &CacheKey, dependencies: BTreeSet<CacheKey>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key).cloned() {
            Some(entry) => {
                entries.insert(key.clone(), Arc::new(entry.with_dependencies(dependencies)));
                true
            }
            None => false,
        }
    }

    /// Flag (or clear) a background refresh failure on the current version
    pub fn set_refresh_error(&self, key: &CacheKey, error: Option<String>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(key).cloned() {
            Some(entry) => {
                entries.insert(key.clone(), Arc::new(entry.with_refresh_error(error)));
                true
            }
            None => false,
        }
    }

    /// Expired entries are left out; they converge by expiring everywhere
    pub(crate) fn digests(&self) -> Vec<EntryDigest> {
        let now = self.clock.now_millis();
        self.entries
            .read()
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| EntryDigest {
                key: entry.key.clone(),
                stamp: entry.stamp,
                checksum: entry.checksum,
            })
            .collect()
    }

    pub fn clear(&self) -> usize {
        let keys: Vec<CacheKey> = {
            let mut entries = self.entries.write();
            let keys = entries.keys().cloned().collect();
            entries.clear();
            self.used_bytes.store(0, Ordering::SeqCst);
            keys
        };

        let cleared = keys.len();
        if cleared > 0 {
            self.removals.notify(&StoreRemoval {
                keys,
                reason: RemovalReason::Cleared,
            });
        }
        cleared
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            stale_hits: self.stats.stale_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            rejected_writes: self.stats.rejected_writes.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expirations: self.stats.expirations.load(Ordering::Relaxed),
            corrupt_purges: self.stats.corrupt_purges.load(Ordering::Relaxed),
            entry_count: self.len(),
            used_bytes: self.used_bytes(),
            max_memory_bytes: self.max_memory_bytes,
        }
    }

    pub(crate) fn record_corrupt_purge(&self) {
        self.stats.corrupt_purges.fetch_add(1, Ordering::Relaxed);
    }

    fn stale_servable(&self, entry: &StoredEntry, now: u64) -> bool {
        self.serve_stale && now <= entry.expires_at.saturating_add(self.stale_grace_ms)
    }

    fn decode(&self, entry: &StoredEntry) -> CacheResult<Arc<[u8]>> {
        if !entry.compressed {
            return Ok(entry.value.clone());
        }
        let raw = compression::decompress(&entry.value, entry.original_size)?;
        Ok(raw.into())
    }

    fn next_tick(&self) -> u64 {
        self.next_tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub(crate) fn corrupt_for_test(&self, key: &CacheKey) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key).cloned() {
            let mut broken = entry.with_refresh_error(None);
            broken.value = vec![0xde, 0xad, 0xbe, 0xef].into();
            broken.compressed = true;
            self.used_bytes
                .fetch_sub(entry.size_bytes(), Ordering::SeqCst);
            self.used_bytes.fetch_add(broken.size_bytes(), Ordering::SeqCst);
            entries.insert(key.clone(), Arc::new(broken));
        }
    }
}
