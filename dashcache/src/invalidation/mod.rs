// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Selective invalidation: rules, dependency cascades and debouncing

pub mod debounce;
pub mod graph;
pub mod rules;

pub use debounce::{Debouncer, PendingBatch};
pub use graph::DependencyGraph;
pub use rules::{InvalidationMode, InvalidationRule, MatchType, RuleId, RuleSet, RuleTarget};

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::InvalidationConfig;
use crate::error::CacheResult;
use crate::events::{SubscriptionId, Subscribers};
use crate::refresh::{BackgroundRefresher, LoaderRegistry, RefreshReason};
use crate::store::{CacheKey, CacheStore, Priority, RemovalReason};

/// Options for [`InvalidationEngine::invalidate`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidateOptions {
    /// Also invalidate transitive dependents
    pub cascade: bool,
    /// Keys left untouched even if matched or reached by the cascade
    pub preserve: Vec<CacheKey>,
    /// Reschedule removed keys for loading; `None` uses the configured default
    pub refetch: Option<bool>,
}

impl InvalidateOptions {
    pub fn cascading() -> Self {
        Self {
            cascade: true,
            ..Self::default()
        }
    }

    pub fn preserve(mut self, key: CacheKey) -> Self {
        self.preserve.push(key);
        self
    }

    pub fn refetch(mut self, refetch: bool) -> Self {
        self.refetch = Some(refetch);
        self
    }
}

/// Options for [`InvalidationEngine::delete`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOptions {
    /// Keep entries that depended on the deleted key
    pub preserve_dependents: bool,
    pub preserve: Vec<CacheKey>,
}

impl DeleteOptions {
    pub fn preserving_dependents() -> Self {
        Self {
            preserve_dependents: true,
            ..Self::default()
        }
    }

    pub fn preserve(mut self, key: CacheKey) -> Self {
        self.preserve.push(key);
        self
    }
}

/// What caused an invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationTrigger {
    Explicit,
    Rule { event_key: CacheKey },
    Debounced { event_key: CacheKey, events: u64 },
    Delete { key: CacheKey },
}

impl std::fmt::Display for InvalidationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationTrigger::Explicit => write!(f, "explicit"),
            InvalidationTrigger::Rule { event_key } => write!(f, "rule({})", event_key),
            InvalidationTrigger::Debounced { event_key, events } => {
                write!(f, "debounced({}, {} events)", event_key, events)
            }
            InvalidationTrigger::Delete { key } => write!(f, "delete({})", key),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationOutcome {
    pub removed: BTreeSet<CacheKey>,
    /// Preserved keys that would otherwise have been removed
    pub preserved: BTreeSet<CacheKey>,
    /// Keys reached only through dependency edges
    pub cascaded: usize,
    pub cascade_depth: usize,
    pub refetch_scheduled: usize,
}

/// Delivered to `on_invalidate` observers
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationNotice {
    pub removed: BTreeSet<CacheKey>,
    pub preserved: BTreeSet<CacheKey>,
    pub trigger: InvalidationTrigger,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationRecord {
    pub trigger: InvalidationTrigger,
    pub removed: usize,
    pub preserved: usize,
    pub cascade_depth: usize,
    pub duration: Duration,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
struct InvalidationStats {
    events: AtomicU64,
    invalidations: AtomicU64,
    keys_removed: AtomicU64,
    cascaded_keys: AtomicU64,
    preserved_keys: AtomicU64,
    debounced_events: AtomicU64,
    coalesced_events: AtomicU64,
    refetches: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationStatsSnapshot {
    pub events: u64,
    pub invalidations: u64,
    pub keys_removed: u64,
    pub cascaded_keys: u64,
    pub preserved_keys: u64,
    pub debounced_events: u64,
    pub coalesced_events: u64,
    pub refetches: u64,
    pub rules: usize,
    pub dependency_edges: usize,
    pub pending_debounced: usize,
}

/// Rule, dependency and debounce driven invalidation over a [`CacheStore`]
pub struct InvalidationEngine {
    config: InvalidationConfig,
    store: Arc<CacheStore>,
    refresher: Arc<BackgroundRefresher>,
    loaders: Arc<LoaderRegistry>,
    rules: RwLock<RuleSet>,
    graph: RwLock<DependencyGraph>,
    debouncer: Debouncer,
    stats: InvalidationStats,
    history: Mutex<VecDeque<InvalidationRecord>>,
    observers: Subscribers<InvalidationNotice>,
}

impl InvalidationEngine {
    pub fn new(
        config: InvalidationConfig,
        store: Arc<CacheStore>,
        refresher: Arc<BackgroundRefresher>,
        loaders: Arc<LoaderRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            refresher,
            loaders,
            rules: RwLock::new(RuleSet::new()),
            graph: RwLock::new(DependencyGraph::new()),
            debouncer: Debouncer::new(),
            stats: InvalidationStats::default(),
            history: Mutex::new(VecDeque::new()),
            observers: Subscribers::new(),
        }
    }

    pub fn add_rule(&self, rule: InvalidationRule) -> CacheResult<RuleId> {
        let id = self.rules.write().add(rule)?;
        log::debug!("Registered invalidation rule {:?}", id);
        Ok(id)
    }

    pub fn remove_rule(&self, id: RuleId) -> Option<InvalidationRule> {
        self.rules.write().remove(id)
    }

    /// Keys the rules produce for an event, in precedence order
    pub fn evaluate(&self, event_key: &CacheKey) -> Vec<CacheKey> {
        self.rules
            .read()
            .evaluate(event_key)
            .into_iter()
            .map(|target| target.key)
            .collect()
    }

    pub fn add_dependency(&self, entry: &CacheKey, dependencies: impl IntoIterator<Item = CacheKey>) {
        self.graph.write().add(entry, dependencies);
    }

    pub fn remove_dependency(&self, entry: &CacheKey, dependency: &CacheKey) -> bool {
        self.graph.write().remove(entry, dependency)
    }

    pub fn replace_dependencies(
        &self,
        entry: &CacheKey,
        dependencies: impl IntoIterator<Item = CacheKey>,
    ) {
        self.graph.write().replace(entry, dependencies);
    }

    /// Drop the edges owned by a destroyed entry
    pub fn forget_entry(&self, entry: &CacheKey) {
        self.graph.write().remove_entry(entry);
    }

    pub fn dependencies_of(&self, entry: &CacheKey) -> BTreeSet<CacheKey> {
        self.graph.read().dependencies_of(entry)
    }

    pub fn dependents_of(&self, key: &CacheKey) -> BTreeSet<CacheKey> {
        self.graph.read().dependents_of(key)
    }

    pub fn on_invalidate<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&InvalidationNotice) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Remove `keys` (and, when cascading, their dependents) except `preserve`
    pub fn invalidate(
        &self,
        keys: &[CacheKey],
        options: &InvalidateOptions,
        trigger: InvalidationTrigger,
    ) -> InvalidationOutcome {
        let started = Instant::now();
        let preserve: HashSet<CacheKey> = options.preserve.iter().cloned().collect();

        let mut outcome = InvalidationOutcome::default();
        let mut roots = BTreeSet::new();
        for key in keys {
            if preserve.contains(key) {
                outcome.preserved.insert(key.clone());
            } else {
                roots.insert(key.clone());
            }
        }

        let (cascaded, depth) = if options.cascade {
            let graph = self.graph.read();
            let (cascaded, depth) = graph.cascade(&roots, &preserve, self.config.max_cascade_depth);
            let reached: HashSet<&CacheKey> = roots.iter().chain(cascaded.iter()).collect();
            for kept in &preserve {
                if graph
                    .dependencies_of(kept)
                    .iter()
                    .any(|dependency| reached.contains(dependency))
                {
                    outcome.preserved.insert(kept.clone());
                }
            }
            (cascaded, depth)
        } else {
            (Vec::new(), 0)
        };
        outcome.cascade_depth = depth;

        for key in &roots {
            if self.store.remove(key, RemovalReason::Invalidated).is_some() {
                outcome.removed.insert(key.clone());
            }
        }
        for key in &cascaded {
            if self.store.remove(key, RemovalReason::Invalidated).is_some() {
                outcome.removed.insert(key.clone());
                outcome.cascaded += 1;
            }
        }

        if options.refetch.unwrap_or(self.config.refetch_on_invalidate) {
            outcome.refetch_scheduled = self.schedule_refetch(&outcome.removed);
        }

        self.finish(&outcome, trigger, started);
        outcome
    }

    /// Delete `key`; unless told otherwise, also delete every dependent whose
    /// remaining dependencies are no longer live, transitively
    pub fn delete(&self, key: &CacheKey, options: &DeleteOptions) -> InvalidationOutcome {
        let started = Instant::now();
        let preserve: HashSet<&CacheKey> = options.preserve.iter().collect();
        let mut outcome = InvalidationOutcome::default();

        if self.store.remove(key, RemovalReason::Deleted).is_some() {
            outcome.removed.insert(key.clone());
        }

        if !options.preserve_dependents {
            let mut gone: HashSet<CacheKey> = HashSet::from([key.clone()]);
            let mut frontier: VecDeque<(CacheKey, usize)> = VecDeque::from([(key.clone(), 0)]);

            while let Some((current, depth)) = frontier.pop_front() {
                if depth >= self.config.max_cascade_depth {
                    continue;
                }
                for dependent in self.dependents_of(&current) {
                    if gone.contains(&dependent) {
                        continue;
                    }
                    if preserve.contains(&dependent) {
                        outcome.preserved.insert(dependent);
                        continue;
                    }
                    let orphaned = self
                        .dependencies_of(&dependent)
                        .iter()
                        .all(|dependency| gone.contains(dependency) || !self.store.is_live(dependency));
                    if !orphaned {
                        continue;
                    }

                    if self.store.remove(&dependent, RemovalReason::Invalidated).is_some() {
                        outcome.removed.insert(dependent.clone());
                        outcome.cascaded += 1;
                    }
                    outcome.cascade_depth = outcome.cascade_depth.max(depth + 1);
                    gone.insert(dependent.clone());
                    frontier.push_back((dependent, depth + 1));
                }
            }
        }

        self.finish(
            &outcome,
            InvalidationTrigger::Delete { key: key.clone() },
            started,
        );
        outcome
    }

    /// Run the rules for an event. Immediate targets are invalidated now,
    /// debounced ones are coalesced and flushed after the debounce window.
    /// With `exclude_self` the event key itself is never a target.
    pub fn handle_event(self: &Arc<Self>, event_key: &CacheKey, exclude_self: bool) -> InvalidationOutcome {
        self.stats.events.fetch_add(1, Ordering::Relaxed);

        let targets = self.rules.read().evaluate(event_key);
        let (immediate, debounced): (Vec<RuleTarget>, Vec<RuleTarget>) = targets
            .into_iter()
            .filter(|target| !(exclude_self && &target.key == event_key))
            .partition(|target| target.mode == InvalidationMode::Immediate);

        if !debounced.is_empty() {
            self.stats.debounced_events.fetch_add(1, Ordering::Relaxed);
            let opened = self
                .debouncer
                .submit(event_key, debounced.into_iter().map(|target| target.key));
            if opened {
                self.schedule_flush(event_key.clone());
            }
        }

        if immediate.is_empty() {
            return InvalidationOutcome::default();
        }
        let keys: Vec<CacheKey> = immediate.into_iter().map(|target| target.key).collect();
        self.invalidate(
            &keys,
            &InvalidateOptions::cascading(),
            InvalidationTrigger::Rule {
                event_key: event_key.clone(),
            },
        )
    }

    /// Flush the debounced batch for one event key now
    pub fn flush(&self, event_key: &CacheKey) -> Option<InvalidationOutcome> {
        let batch = self.debouncer.take(event_key)?;
        Some(self.flush_batch(event_key.clone(), batch))
    }

    /// Flush every pending debounced batch now
    pub fn flush_all(&self) -> Vec<InvalidationOutcome> {
        self.debouncer
            .take_all()
            .into_iter()
            .map(|(event_key, batch)| self.flush_batch(event_key, batch))
            .collect()
    }

    pub fn pending_debounced(&self) -> usize {
        self.debouncer.pending_events()
    }

    pub fn history(&self, limit: usize) -> Vec<InvalidationRecord> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> InvalidationStatsSnapshot {
        InvalidationStatsSnapshot {
            events: self.stats.events.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            keys_removed: self.stats.keys_removed.load(Ordering::Relaxed),
            cascaded_keys: self.stats.cascaded_keys.load(Ordering::Relaxed),
            preserved_keys: self.stats.preserved_keys.load(Ordering::Relaxed),
            debounced_events: self.stats.debounced_events.load(Ordering::Relaxed),
            coalesced_events: self.stats.coalesced_events.load(Ordering::Relaxed),
            refetches: self.stats.refetches.load(Ordering::Relaxed),
            rules: self.rules.read().len(),
            dependency_edges: self.graph.read().edge_count(),
            pending_debounced: self.debouncer.pending_events(),
        }
    }

    pub fn clear_graph(&self) {
        self.graph.write().clear();
    }

    fn flush_batch(&self, event_key: CacheKey, batch: PendingBatch) -> InvalidationOutcome {
        if batch.events > 1 {
            self.stats
                .coalesced_events
                .fetch_add(batch.events - 1, Ordering::Relaxed);
        }
        let keys: Vec<CacheKey> = batch.targets.into_iter().collect();
        log::debug!(
            "Flushing {} debounced events for {} ({} targets)",
            batch.events,
            event_key,
            keys.len()
        );
        self.invalidate(
            &keys,
            &InvalidateOptions::cascading(),
            InvalidationTrigger::Debounced {
                event_key,
                events: batch.events,
            },
        )
    }

    fn schedule_flush(self: &Arc<Self>, event_key: CacheKey) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = Arc::clone(self);
                let window = self.config.debounce_window;
                handle.spawn(async move {
                    tokio::time::sleep(window).await;
                    engine.flush(&event_key);
                });
            }
            Err(_) => {
                // No runtime to wait on
                self.flush(&event_key);
            }
        }
    }

    fn schedule_refetch(&self, removed: &BTreeSet<CacheKey>) -> usize {
        let mut scheduled = 0;
        for key in removed {
            if self.loaders.has_loader(key)
                && self
                    .refresher
                    .schedule(key.clone(), Priority::Important, RefreshReason::Repopulate)
            {
                scheduled += 1;
            }
        }
        self.stats
            .refetches
            .fetch_add(scheduled as u64, Ordering::Relaxed);
        scheduled
    }

    fn finish(&self, outcome: &InvalidationOutcome, trigger: InvalidationTrigger, started: Instant) {
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        self.stats
            .keys_removed
            .fetch_add(outcome.removed.len() as u64, Ordering::Relaxed);
        self.stats
            .cascaded_keys
            .fetch_add(outcome.cascaded as u64, Ordering::Relaxed);
        self.stats
            .preserved_keys
            .fetch_add(outcome.preserved.len() as u64, Ordering::Relaxed);

        if !outcome.removed.is_empty() {
            log::debug!(
                "Invalidated {} keys ({} cascaded, {} preserved) via {}",
                outcome.removed.len(),
                outcome.cascaded,
                outcome.preserved.len(),
                trigger
            );
        }

        if self.config.max_history > 0 {
            let mut history = self.history.lock();
            if history.len() >= self.config.max_history {
                history.pop_front();
            }
            history.push_back(InvalidationRecord {
                trigger: trigger.clone(),
                removed: outcome.removed.len(),
                preserved: outcome.preserved.len(),
                cascade_depth: outcome.cascade_depth,
                duration: started.elapsed(),
                timestamp: self.store.clock().now_millis(),
            });
        }

        self.observers.notify(&InvalidationNotice {
            removed: outcome.removed.clone(),
            preserved: outcome.preserved.clone(),
            trigger,
        });
    }
}
