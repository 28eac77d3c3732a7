// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Central cache management and coordination
//!
//! [`CacheManager`] wires the store, TTL engine, refresher, invalidation
//! engine, consistency coordinator and memory optimizer together. It is a
//! cheap handle: clones share one instance. There is no global state, so
//! independently configured managers can coexist in one process.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{SharedClock, SystemClock};
use crate::config::CacheConfig;
use crate::consistency::{
    ConsistencyChannel, ConsistencyCoordinator, ConsistencyReport, InMemoryHub, MutationOp,
    RemoteChange, Repairer,
};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventLog, SubscriptionId};
use crate::invalidation::{
    DeleteOptions, InvalidateOptions, InvalidationEngine, InvalidationNotice, InvalidationOutcome,
    InvalidationRule, InvalidationTrigger, RuleId,
};
use crate::optimizer::{MemoryOptimizer, OptimizationReason, OptimizationRun};
use crate::refresh::{
    BackgroundRefresher, LoadContext, Loader, LoaderRegistry, RefreshFailure, RefreshHandler,
    RefreshReason, RefreshStart, RefreshTask, WriteBack,
};
use crate::stats::{CacheHealthScore, CacheStatsSnapshot};
use crate::store::{
    BackingStore, CacheEntry, CacheKey, CacheLookup, CacheStore, EntryMetadata, EntrySource,
    Priority, RemovalReason, SetOptions, StoreRemoval, WriteCondition, WriteOutcome, WriteReport,
    WriteRequest,
};
use crate::ttl::{AdaptiveTtlEngine, SystemSignals, TtlContext};

/// Where a write comes from; decides its guard and side effects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOrigin {
    Explicit,
    Loader,
    Backing,
    /// Background refresh, guarded by the version seen when it started
    Refresh { baseline: Option<u64> },
}

impl WriteOrigin {
    fn source(&self) -> EntrySource {
        match self {
            WriteOrigin::Explicit => EntrySource::Explicit,
            WriteOrigin::Loader => EntrySource::Loader,
            WriteOrigin::Backing => EntrySource::Backing,
            WriteOrigin::Refresh { .. } => EntrySource::Refresh,
        }
    }

    fn condition(&self) -> WriteCondition {
        match self {
            WriteOrigin::Refresh { baseline } => WriteCondition::IfVersion(*baseline),
            _ => WriteCondition::Always,
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

struct ManagerInner {
    config: CacheConfig,
    clock: SharedClock,
    store: Arc<CacheStore>,
    ttl: AdaptiveTtlEngine,
    signals: RwLock<SystemSignals>,
    loaders: Arc<LoaderRegistry>,
    refresher: Arc<BackgroundRefresher>,
    invalidation: Arc<InvalidationEngine>,
    consistency: Arc<ConsistencyCoordinator>,
    optimizer: Arc<MemoryOptimizer>,
    backing: Option<Arc<dyn BackingStore>>,
    events: EventLog,
    running: Mutex<Option<Running>>,
}

/// Builder for [`CacheManager`]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    clock: Option<SharedClock>,
    channel: Option<Arc<dyn ConsistencyChannel>>,
    backing: Option<Arc<dyn BackingStore>>,
}

impl Default for CacheManagerBuilder {
    fn default() -> Self {
        Self {
            config: CacheConfig::default(),
            clock: None,
            channel: None,
            backing: None,
        }
    }
}

impl CacheManagerBuilder {
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Transport shared with peer contexts; defaults to a private in-memory hub
    pub fn with_channel(mut self, channel: Arc<dyn ConsistencyChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_backing_store(mut self, backing: Arc<dyn BackingStore>) -> Self {
        self.backing = Some(backing);
        self
    }

    pub fn build(self) -> CacheResult<CacheManager> {
        self.config.validate()?;
        let config = self.config;
        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let channel: Arc<dyn ConsistencyChannel> = match self.channel {
            Some(channel) => channel,
            None => InMemoryHub::new(config.consistency.channel_capacity).channel(),
        };

        let store = Arc::new(CacheStore::new(&config, clock.clone()));
        let loaders = Arc::new(LoaderRegistry::new());
        let refresher = Arc::new(BackgroundRefresher::new(config.refresh.clone()));
        let invalidation = Arc::new(InvalidationEngine::new(
            config.invalidation.clone(),
            store.clone(),
            refresher.clone(),
            loaders.clone(),
        ));
        let consistency = Arc::new(ConsistencyCoordinator::new(
            config.consistency.clone(),
            store.clone(),
            channel,
        ));
        let optimizer = Arc::new(MemoryOptimizer::new(config.optimizer.clone(), store.clone()));

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            wire_observers(weak, &store, &refresher, &invalidation, &consistency);
            ManagerInner {
                ttl: AdaptiveTtlEngine::new(config.ttl.clone()),
                events: EventLog::new(config.max_events),
                config,
                clock,
                store,
                signals: RwLock::new(SystemSignals::default()),
                loaders,
                refresher,
                invalidation,
                consistency,
                optimizer,
                backing: self.backing,
                running: Mutex::new(None),
            }
        });

        log::debug!("Cache manager {} created", inner.consistency.origin());
        Ok(CacheManager { inner })
    }
}

/// Subscriptions that keep the components in sync. Every handler holds a
/// weak reference so the components never keep the manager alive.
fn wire_observers(
    weak: &Weak<ManagerInner>,
    store: &CacheStore,
    refresher: &BackgroundRefresher,
    invalidation: &InvalidationEngine,
    consistency: &ConsistencyCoordinator,
) {
    let manager = weak.clone();
    store.on_removal(move |removal| {
        if let Some(inner) = manager.upgrade() {
            inner.after_removal(removal);
        }
    });

    let manager = weak.clone();
    invalidation.on_invalidate(move |notice| {
        if let Some(inner) = manager.upgrade() {
            inner.after_invalidation(notice);
        }
    });

    let manager = weak.clone();
    refresher.on_failure(move |failure| {
        if let Some(inner) = manager.upgrade() {
            inner.after_refresh_failure(failure);
        }
    });

    let manager = weak.clone();
    consistency.on_remote_change(move |change| {
        if let Some(inner) = manager.upgrade() {
            inner.after_remote_change(change);
        }
    });
}

impl ManagerInner {
    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    fn ttl_for(&self, data_type: &str) -> Duration {
        let signals = *self.signals.read();
        let context = TtlContext::at(data_type, self.clock.now_utc())
            .with_load(signals.system_load)
            .with_activity(signals.user_activity);
        self.ttl.compute_ttl(&context)
    }

    /// Resolve, write and propagate a value. `None` when a refresh guard
    /// found a newer write.
    fn write_value(
        &self,
        key: &CacheKey,
        raw: Vec<u8>,
        options: &SetOptions,
        origin: WriteOrigin,
    ) -> CacheResult<Option<WriteReport>> {
        key.validate()?;
        for dependency in &options.dependencies {
            dependency.validate()?;
        }
        let ttl = match options.ttl {
            Some(ttl) => ttl,
            None => self.ttl_for(options.data_type.as_deref().unwrap_or(&key.namespace)),
        };

        let broadcast = self.consistency.is_enabled().then(|| raw.clone());
        let persist = match (&self.backing, origin) {
            (Some(_), WriteOrigin::Backing) | (None, _) => None,
            (Some(_), _) => Some(raw.clone()),
        };

        let dependencies: BTreeSet<CacheKey> = options.dependencies.iter().cloned().collect();
        let request = WriteRequest {
            key: key.clone(),
            raw,
            ttl,
            dependencies: dependencies.clone(),
            priority: options.priority,
            metadata: EntryMetadata {
                source: origin.source(),
                prefetched: options.prefetched,
            },
            stamp: self.consistency.next_stamp(),
            condition: origin.condition(),
            preserve_identity: matches!(origin, WriteOrigin::Refresh { baseline: Some(_) }),
        };

        let report = match self.store.write(request) {
            Ok(WriteOutcome::Written(report)) => report,
            Ok(WriteOutcome::Discarded) => return Ok(None),
            Err(e) => {
                self.events.record(CacheEvent::WriteRejected {
                    key: key.clone(),
                    reason: e.to_string(),
                    timestamp: self.now(),
                });
                return Err(e);
            }
        };

        if !matches!(origin, WriteOrigin::Refresh { baseline: Some(_) }) {
            self.invalidation.replace_dependencies(key, dependencies);
        }

        self.events.record(CacheEvent::Write {
            key: key.clone(),
            size_bytes: report.size_bytes,
            compressed: report.compressed,
            timestamp: self.now(),
        });
        log::debug!(
            "Stored {} ({} bytes, {:?} ttl, {:?})",
            key,
            report.size_bytes,
            ttl,
            origin
        );

        if let (Some(backing), Some(value)) = (&self.backing, persist) {
            if let Err(e) = backing.persist(key, &value) {
                log::warn!("Write-through of {} to {} failed: {}", key, backing.name(), e);
            }
        }

        if let Some(value) = broadcast {
            // A newer write that raced us broadcasts itself
            if let Some(entry) = self.store.peek(key).filter(|e| e.version == report.version) {
                self.consistency.publish_set(&entry, &value);
            }
        }

        Ok(Some(report))
    }

    /// Schedule stale-while-revalidate or refresh-ahead work for a hit
    fn schedule_after_hit(&self, key: &CacheKey, lookup: &CacheLookup) {
        if !self.loaders.has_loader(key) {
            return;
        }
        let scheduled = if lookup.stale {
            self.refresher
                .schedule(key.clone(), Priority::Normal, RefreshReason::Stale)
                .then_some(RefreshReason::Stale)
        } else {
            let ratio = self.config.refresh_ahead_ratio;
            let near_expiry = match (lookup.remaining, lookup.ttl) {
                (Some(remaining), Some(ttl)) => {
                    ratio > 0.0 && remaining.as_secs_f64() < ttl.as_secs_f64() * ratio
                }
                _ => false,
            };
            (near_expiry
                && self
                    .refresher
                    .schedule(key.clone(), Priority::Low, RefreshReason::RefreshAhead))
            .then_some(RefreshReason::RefreshAhead)
        };

        if let Some(reason) = scheduled {
            self.events.record(CacheEvent::RefreshScheduled {
                key: key.clone(),
                reason: reason.to_string(),
                timestamp: self.now(),
            });
        }
    }

    fn read_through(&self, key: &CacheKey) -> Option<CacheLookup> {
        let backing = self.backing.as_ref()?;
        let raw = match backing.load(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Read-through of {} from {} failed: {}", key, backing.name(), e);
                return None;
            }
        };

        let value: Arc<[u8]> = raw.clone().into();
        match self.write_value(key, raw, &SetOptions::default(), WriteOrigin::Backing) {
            Ok(Some(report)) => {
                let ttl = self.store.peek(key).map(|entry| entry.ttl());
                Some(CacheLookup {
                    hit: true,
                    value: Some(value),
                    version: Some(report.version),
                    ttl,
                    remaining: ttl,
                    ..CacheLookup::default()
                })
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Could not cache {} loaded from {}: {}", key, backing.name(), e);
                None
            }
        }
    }

    async fn load_with_timeout(&self, loader: &dyn Loader, key: &CacheKey) -> CacheResult<Vec<u8>> {
        let timeout = self.config.refresh.task_timeout;
        match tokio::time::timeout(timeout, loader.load(key)).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        }
    }

    fn after_removal(&self, removal: &StoreRemoval) {
        // Invalidated keys keep their loader for the refetch
        let keep_loader = removal.reason == RemovalReason::Invalidated;
        for key in &removal.keys {
            self.invalidation.forget_entry(key);
            self.refresher.cancel(key);
            if !keep_loader {
                self.loaders.forget_key(key);
            }
        }
        let timestamp = self.now();
        match removal.reason {
            RemovalReason::Evicted | RemovalReason::Pressure => {
                self.events.record(CacheEvent::Eviction {
                    keys: removal.keys.clone(),
                    reason: format!("{:?}", removal.reason).to_lowercase(),
                    timestamp,
                });
            }
            RemovalReason::Corrupt => {
                for key in &removal.keys {
                    self.events.record(CacheEvent::CorruptEntryPurged {
                        key: key.clone(),
                        timestamp,
                    });
                }
            }
            _ => {}
        }
    }

    /// Propagate a local removal to peers and the backing store
    fn forget_remote(&self, key: &CacheKey) {
        self.consistency
            .publish_delete(key, self.consistency.next_stamp());
        if let Some(backing) = &self.backing {
            if let Err(e) = backing.remove(key) {
                log::warn!("Removing {} from {} failed: {}", key, backing.name(), e);
            }
        }
    }

    fn after_invalidation(&self, notice: &InvalidationNotice) {
        for key in &notice.removed {
            self.forget_remote(key);
        }
        self.events.record(CacheEvent::Invalidation {
            removed: notice.removed.len(),
            preserved: notice.preserved.len(),
            trigger: notice.trigger.to_string(),
            timestamp: self.now(),
        });
    }

    fn after_refresh_failure(&self, failure: &RefreshFailure) {
        self.store
            .set_refresh_error(&failure.key, Some(failure.error.clone()));
        self.events.record(CacheEvent::RefreshFailed {
            key: failure.key.clone(),
            error: failure.error.clone(),
            timestamp: self.now(),
        });
    }

    fn after_remote_change(&self, change: &RemoteChange) {
        if let (MutationOp::Set, Some(dependencies)) = (change.op, &change.dependencies) {
            self.invalidation
                .replace_dependencies(&change.key, dependencies.iter().cloned());
            self.refresher.cancel_queued(&change.key);
        }
        self.events.record(CacheEvent::RemoteApplied {
            key: change.key.clone(),
            op: change.op.to_string(),
            timestamp: self.now(),
        });
    }
}

/// Background refresh and repair both go through the manager
struct ManagerBridge {
    inner: Weak<ManagerInner>,
}

impl ManagerBridge {
    fn manager(&self) -> CacheResult<Arc<ManagerInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| CacheError::invalid("cache manager dropped"))
    }
}

#[async_trait]
impl RefreshHandler for ManagerBridge {
    fn begin(&self, task: &RefreshTask) -> RefreshStart {
        let Ok(inner) = self.manager() else {
            return RefreshStart::Skip;
        };
        let version = inner.store.version_of(&task.key);
        if task.reason.requires_entry() && version.is_none() {
            return RefreshStart::Skip;
        }
        RefreshStart::Proceed { baseline: version }
    }

    async fn fetch(&self, key: &CacheKey) -> CacheResult<Vec<u8>> {
        let inner = self.manager()?;
        let registered = inner
            .loaders
            .resolve(key)
            .ok_or_else(|| CacheError::NoLoader(key.to_string()))?;
        registered.loader.load(key).await
    }

    fn complete(
        &self,
        task: &RefreshTask,
        baseline: Option<u64>,
        value: Vec<u8>,
    ) -> CacheResult<WriteBack> {
        let inner = self.manager()?;
        let data_type = inner
            .loaders
            .resolve(&task.key)
            .map(|registered| registered.context.data_type_for(&task.key).to_string());
        let options = SetOptions {
            data_type,
            ..SetOptions::default()
        };
        match inner.write_value(&task.key, value, &options, WriteOrigin::Refresh { baseline })? {
            Some(_) => Ok(WriteBack::Applied),
            None => Ok(WriteBack::Superseded),
        }
    }
}

#[async_trait]
impl Repairer for ManagerBridge {
    async fn repair(&self, key: &CacheKey) -> CacheResult<()> {
        let inner = self.manager()?;
        let registered = inner
            .loaders
            .resolve(key)
            .ok_or_else(|| CacheError::NoLoader(key.to_string()))?;

        let loaded = inner
            .load_with_timeout(registered.loader.as_ref(), key)
            .await;
        let raw = match loaded {
            Ok(raw) => raw,
            Err(e) => {
                // Leave retries to the refresher
                inner
                    .refresher
                    .schedule(key.clone(), Priority::Important, RefreshReason::Repair);
                return Err(e);
            }
        };

        let options = SetOptions {
            data_type: Some(registered.context.data_type_for(key).to_string()),
            ..SetOptions::default()
        };
        inner.write_value(key, raw, &options, WriteOrigin::Loader)?;
        Ok(())
    }
}

/// Adaptive caching and invalidation engine
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<ManagerInner>,
}

impl CacheManager {
    /// Create a manager with its own private consistency hub
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::builder().with_config(config).build()
    }

    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Identity of this context in consistency messages
    pub fn origin(&self) -> uuid::Uuid {
        self.inner.consistency.origin()
    }

    /// Look up a value. Expired entries inside the stale grace window are
    /// served with `stale = true` and refreshed in the background.
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let inner = &self.inner;
        if !inner.config.enabled {
            return CacheLookup::default();
        }

        let lookup = inner.store.get(key);
        if lookup.hit {
            log::debug!("Cache hit for {}{}", key, if lookup.stale { " (stale)" } else { "" });
            inner.events.record(CacheEvent::Hit {
                key: key.clone(),
                stale: lookup.stale,
                timestamp: inner.now(),
            });
            inner.schedule_after_hit(key, &lookup);
            return lookup;
        }

        if let Some(loaded) = inner.read_through(key) {
            return loaded;
        }

        log::debug!("Cache miss for {}", key);
        inner.events.record(CacheEvent::Miss {
            key: key.clone(),
            timestamp: inner.now(),
        });
        lookup
    }

    /// Typed read. A value that does not decode is purged and reported as a miss.
    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let lookup = self.get(key);
        let value = lookup.value?;
        match serde_json::from_slice(&value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                log::warn!("Purging {}: value does not decode: {}", key, e);
                if let Some(version) = lookup.version {
                    if self
                        .inner
                        .store
                        .remove_if_version(key, version, RemovalReason::Corrupt)
                    {
                        self.inner.store.record_corrupt_purge();
                    }
                }
                None
            }
        }
    }

    /// Store a value. Oversized values and malformed arguments are rejected
    /// and leave the cache unchanged.
    pub fn set(
        &self,
        key: &CacheKey,
        value: impl Into<Vec<u8>>,
        options: SetOptions,
    ) -> CacheResult<WriteReport> {
        let inner = &self.inner;
        let raw = value.into();
        if !inner.config.enabled {
            key.validate()?;
            return Ok(WriteReport {
                version: 0,
                size_bytes: 0,
                original_size: raw.len(),
                compressed: false,
                compression_ratio: None,
                replaced: false,
                evicted: Vec::new(),
            });
        }

        let report = inner
            .write_value(key, raw, &options, WriteOrigin::Explicit)?
            .ok_or_else(|| CacheError::invalid(format!("write to {} was discarded", key)))?;

        // An explicit write supersedes queued refreshes; in-flight ones fail
        // their version check
        inner.refresher.cancel_queued(key);
        inner.invalidation.handle_event(key, true);
        Ok(report)
    }

    pub fn set_json<T: Serialize>(
        &self,
        key: &CacheKey,
        value: &T,
        options: SetOptions,
    ) -> CacheResult<WriteReport> {
        let raw = serde_json::to_vec(value)?;
        self.set(key, raw, options)
    }

    /// Return the cached value, or load, cache and return it. The loader is
    /// remembered for background refresh of this key.
    pub async fn get_or_load(
        &self,
        key: &CacheKey,
        loader: Arc<dyn Loader>,
        options: SetOptions,
    ) -> CacheResult<Arc<[u8]>> {
        key.validate()?;
        let inner = &self.inner;
        let context = LoadContext {
            data_type: options.data_type.clone(),
        };
        inner
            .loaders
            .register_key(key.clone(), loader.clone(), context);

        let lookup = self.get(key);
        if let Some(value) = lookup.value {
            return Ok(value);
        }

        let raw = inner.load_with_timeout(loader.as_ref(), key).await?;
        let value: Arc<[u8]> = raw.clone().into();
        if inner.config.enabled {
            inner.write_value(key, raw, &options, WriteOrigin::Loader)?;
        }
        Ok(value)
    }

    /// Delete a key and, unless preserved, the dependents it orphans
    pub fn delete(&self, key: &CacheKey, options: DeleteOptions) -> InvalidationOutcome {
        let inner = &self.inner;
        let outcome = inner.invalidation.delete(key, &options);
        inner.loaders.forget_key(key);
        if !outcome.removed.contains(key) {
            // Nothing local to remove; peers and the backing store may still hold it
            inner.forget_remote(key);
        }
        inner.invalidation.handle_event(key, true);
        outcome
    }

    /// Invalidate keys; removed keys with a loader are repopulated in the
    /// background unless `refetch` is disabled
    pub fn invalidate(&self, keys: &[CacheKey], options: InvalidateOptions) -> InvalidationOutcome {
        self.inner
            .invalidation
            .invalidate(keys, &options, InvalidationTrigger::Explicit)
    }

    /// Run the invalidation rules for an external event
    pub fn trigger_invalidation(&self, event_key: &CacheKey) -> InvalidationOutcome {
        self.inner.invalidation.handle_event(event_key, false)
    }

    pub fn add_invalidation_rule(&self, rule: InvalidationRule) -> CacheResult<RuleId> {
        self.inner.invalidation.add_rule(rule)
    }

    pub fn remove_invalidation_rule(&self, id: RuleId) -> Option<InvalidationRule> {
        self.inner.invalidation.remove_rule(id)
    }

    /// Flush debounced invalidations without waiting for their window
    pub fn flush_invalidations(&self) -> Vec<InvalidationOutcome> {
        self.inner.invalidation.flush_all()
    }

    /// Queue an `Important` refresh of `key`
    pub fn force_refresh(&self, key: &CacheKey) -> CacheResult<bool> {
        key.validate()?;
        let inner = &self.inner;
        if !inner.loaders.has_loader(key) {
            return Err(CacheError::NoLoader(key.to_string()));
        }
        let scheduled = inner
            .refresher
            .schedule(key.clone(), Priority::Important, RefreshReason::Forced);
        inner.events.record(CacheEvent::RefreshScheduled {
            key: key.clone(),
            reason: RefreshReason::Forced.to_string(),
            timestamp: inner.now(),
        });
        Ok(scheduled)
    }

    /// Record that `key` depends on `dependencies`
    pub fn add_dependency(
        &self,
        key: &CacheKey,
        dependencies: impl IntoIterator<Item = CacheKey>,
    ) -> CacheResult<()> {
        key.validate()?;
        let dependencies: Vec<CacheKey> = dependencies.into_iter().collect();
        for dependency in &dependencies {
            dependency.validate()?;
        }
        let inner = &self.inner;
        inner.invalidation.add_dependency(key, dependencies);
        inner
            .store
            .set_dependencies(key, inner.invalidation.dependencies_of(key));
        Ok(())
    }

    pub fn remove_dependency(&self, key: &CacheKey, dependency: &CacheKey) -> bool {
        let inner = &self.inner;
        let removed = inner.invalidation.remove_dependency(key, dependency);
        if removed {
            inner
                .store
                .set_dependencies(key, inner.invalidation.dependencies_of(key));
        }
        removed
    }

    pub fn dependents_of(&self, key: &CacheKey) -> BTreeSet<CacheKey> {
        self.inner.invalidation.dependents_of(key)
    }

    /// Loader for every key of `namespace` without a key-specific loader
    pub fn register_loader(
        &self,
        namespace: impl Into<String>,
        loader: Arc<dyn Loader>,
        context: LoadContext,
    ) {
        self.inner
            .loaders
            .register_namespace(namespace, loader, context);
    }

    pub fn update_signals(&self, signals: SystemSignals) {
        *self.inner.signals.write() = signals;
    }

    pub fn signals(&self) -> SystemSignals {
        *self.inner.signals.read()
    }

    /// TTL the engine would assign to `data_type` right now
    pub fn compute_ttl(&self, data_type: &str) -> Duration {
        self.inner.ttl_for(data_type)
    }

    pub fn ttl_engine(&self) -> &AdaptiveTtlEngine {
        &self.inner.ttl
    }

    /// Entry snapshot without touching LRU order or counters
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.store.peek(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.store.contains(key)
    }

    pub fn get_stats(&self) -> CacheStatsSnapshot {
        let inner = &self.inner;
        CacheStatsSnapshot::assemble(
            inner.store.stats(),
            inner.refresher.stats(),
            inner.invalidation.stats(),
            inner.consistency.stats(),
        )
    }

    pub fn health_score(&self) -> CacheHealthScore {
        CacheHealthScore::assess(&self.get_stats())
    }

    /// Latest reconciliation report, if a check has run
    pub fn get_consistency_report(&self) -> Option<ConsistencyReport> {
        self.inner.consistency.last_report()
    }

    /// Reconcile with peers now. Waits for the configured response window.
    pub async fn force_consistency_check(&self) -> ConsistencyReport {
        let repairer = ManagerBridge {
            inner: Arc::downgrade(&self.inner),
        };
        self.inner
            .consistency
            .force_consistency_check(&repairer)
            .await
    }

    pub fn run_memory_optimizer(&self) -> OptimizationRun {
        self.inner.optimizer.run_once(OptimizationReason::Manual)
    }

    pub fn optimization_history(&self, limit: usize) -> Vec<OptimizationRun> {
        self.inner.optimizer.history(limit)
    }

    /// Most recent first
    pub fn recent_events(&self, limit: usize) -> Vec<CacheEvent> {
        self.inner.events.recent(limit)
    }

    /// Pause background refresh (host backgrounded)
    pub fn suspend_refresh(&self) {
        self.inner.refresher.suspend();
    }

    pub fn resume_refresh(&self) {
        self.inner.refresher.resume();
    }

    /// Drop every local entry, edge, queued refresh and event. Not broadcast.
    pub fn clear(&self) -> usize {
        let inner = &self.inner;
        inner.refresher.cancel_all();
        let cleared = inner.store.clear();
        inner.loaders.clear_keys();
        inner.invalidation.clear_graph();
        inner.events.clear();
        log::info!("Cleared {} cache entries", cleared);
        cleared
    }

    pub fn on_invalidate<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InvalidationNotice) + Send + Sync + 'static,
    {
        self.inner.invalidation.on_invalidate(handler)
    }

    pub fn on_refresh_failure<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RefreshFailure) + Send + Sync + 'static,
    {
        self.inner.refresher.on_failure(handler)
    }

    pub fn on_optimization<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&OptimizationRun) + Send + Sync + 'static,
    {
        self.inner.optimizer.on_optimization(handler)
    }

    pub fn on_remote_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RemoteChange) + Send + Sync + 'static,
    {
        self.inner.consistency.on_remote_change(handler)
    }

    /// Start refresh workers, the consistency loops and the optimizer timer
    /// on the current tokio runtime. Idempotent.
    pub fn start(&self) -> CacheResult<()> {
        tokio::runtime::Handle::try_current()
            .map_err(|_| CacheError::config("CacheManager::start requires a tokio runtime"))?;

        let inner = &self.inner;
        let mut running = inner.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (shutdown, signal) = watch::channel(false);
        let bridge = Arc::new(ManagerBridge {
            inner: Arc::downgrade(inner),
        });

        let mut handles = inner.refresher.start(bridge.clone(), signal.clone());
        handles.extend(inner.consistency.start(bridge, signal.clone()));
        handles.extend(inner.optimizer.start(signal));

        log::info!(
            "Cache manager {} started ({} background tasks)",
            inner.consistency.origin(),
            handles.len()
        );
        *running = Some(Running { shutdown, handles });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Stop background services and flush pending debounced invalidations
    pub async fn shutdown(&self) {
        let running = self.inner.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            for handle in running.handles {
                if let Err(e) = handle.await {
                    log::warn!("Background task ended abnormally: {}", e);
                }
            }
            log::info!("Cache manager {} stopped", self.origin());
        }
        self.inner.invalidation.flush_all();
    }
}
