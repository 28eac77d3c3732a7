// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Eventual consistency across execution contexts
//!
//! Local mutations are broadcast as [`ConsistencyEvent`]s and applied by
//! peers with last-write-wins on `(timestamp, origin)`. Lost messages are
//! compensated by periodic digest reconciliation, not by redelivery.

pub mod channel;
pub mod report;

pub use channel::{
    ChannelMessage, ChannelReceiver, ConsistencyChannel, ConsistencyEvent, EventPayload,
    InMemoryChannel, InMemoryHub, KeyDigest, MutationOp,
};
pub use report::{compare_digests, ConsistencyIssue, ConsistencyReport, KeyState};

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::config::ConsistencyConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{SubscriptionId, Subscribers};
use crate::store::{
    CacheEntry, CacheKey, CacheStore, EntryMetadata, EntrySource, RemovalReason, WriteCondition,
    WriteOutcome, WriteRequest, WriteStamp,
};

/// Reloads a key from its source after reconciliation found drift
#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, key: &CacheKey) -> CacheResult<()>;
}

/// A remote mutation that changed the local store
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub key: CacheKey,
    pub op: MutationOp,
    /// Dependencies of the applied value (remote sets only)
    pub dependencies: Option<Vec<CacheKey>>,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    stamp: WriteStamp,
    recorded_at: u64,
}

#[derive(Debug, Default)]
struct ConsistencyStats {
    sent: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    ignored_stale: AtomicU64,
    decode_errors: AtomicU64,
    checks: AtomicU64,
    pushed: AtomicU64,
    repairs: AtomicU64,
    repair_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyStatsSnapshot {
    pub sent: u64,
    pub send_failures: u64,
    pub received: u64,
    pub applied: u64,
    pub ignored_stale: u64,
    pub decode_errors: u64,
    pub checks: u64,
    pub pushed: u64,
    pub repairs: u64,
    pub repair_failures: u64,
    pub tombstones: usize,
    pub last_score: Option<f64>,
}

/// Broadcasts local mutations and reconciles with peer contexts
pub struct ConsistencyCoordinator {
    config: ConsistencyConfig,
    origin: Uuid,
    store: Arc<CacheStore>,
    channel: Arc<dyn ConsistencyChannel>,
    receiver: Mutex<Option<Box<dyn ChannelReceiver>>>,
    last_timestamp: AtomicU64,
    tombstones: Mutex<HashMap<CacheKey, Tombstone>>,
    next_request: AtomicU64,
    responses: Mutex<HashMap<u64, Vec<(Uuid, Vec<KeyDigest>)>>>,
    last_report: RwLock<Option<ConsistencyReport>>,
    remote_changes: Subscribers<RemoteChange>,
    stats: ConsistencyStats,
}

impl ConsistencyCoordinator {
    /// Subscribes to `channel` immediately so nothing sent after
    /// construction is missed
    pub fn new(
        config: ConsistencyConfig,
        store: Arc<CacheStore>,
        channel: Arc<dyn ConsistencyChannel>,
    ) -> Self {
        let receiver = channel.subscribe();
        Self {
            config,
            origin: Uuid::new_v4(),
            store,
            channel,
            receiver: Mutex::new(Some(receiver)),
            last_timestamp: AtomicU64::new(0),
            tombstones: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
            responses: Mutex::new(HashMap::new()),
            last_report: RwLock::new(None),
            remote_changes: Subscribers::new(),
            stats: ConsistencyStats::default(),
        }
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Hybrid logical timestamp: wall clock, but strictly after every
    /// timestamp issued or observed so far
    pub fn next_timestamp(&self) -> u64 {
        let now = self.store.clock().now_millis();
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self.last_timestamp.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub fn next_stamp(&self) -> WriteStamp {
        WriteStamp::new(self.next_timestamp(), self.origin)
    }

    fn observe(&self, timestamp: u64) {
        self.last_timestamp.fetch_max(timestamp, Ordering::SeqCst);
    }

    pub fn on_remote_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RemoteChange) + Send + Sync + 'static,
    {
        self.remote_changes.subscribe(handler)
    }

    /// Broadcast a local write of `entry` whose raw bytes are `value`
    pub fn publish_set(&self, entry: &CacheEntry, value: &[u8]) {
        self.tombstones.lock().remove(&entry.key);
        self.publish(event_for_entry(entry, value.to_vec()));
    }

    /// Record and broadcast a local delete
    pub fn publish_delete(&self, key: &CacheKey, stamp: WriteStamp) {
        if !self.config.enabled {
            return;
        }
        self.record_tombstone(key, stamp);
        self.publish(ConsistencyEvent {
            key: key.clone(),
            op: MutationOp::Delete,
            timestamp: stamp.timestamp,
            origin_id: stamp.origin,
            payload: None,
        });
    }

    fn publish(&self, event: ConsistencyEvent) {
        if !self.config.enabled {
            return;
        }
        self.send(&ChannelMessage::Mutation {
            sender: self.origin,
            event,
        });
    }

    fn send(&self, message: &ChannelMessage) -> bool {
        let sent = message
            .encode()
            .and_then(|frame| self.channel.send(frame));
        match sent {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping consistency message on {}: {}", self.channel.name(), e);
                false
            }
        }
    }

    fn record_tombstone(&self, key: &CacheKey, stamp: WriteStamp) {
        let recorded_at = self.store.clock().now_millis();
        let mut tombstones = self.tombstones.lock();
        let newer = tombstones
            .get(key)
            .map(|existing| stamp > existing.stamp)
            .unwrap_or(true);
        if newer {
            tombstones.insert(key.clone(), Tombstone { stamp, recorded_at });
        }
    }

    /// Drop tombstones older than the configured lifetime
    pub fn purge_tombstones(&self) -> usize {
        let now = self.store.clock().now_millis();
        let ttl = self.config.tombstone_ttl.as_millis() as u64;
        let mut tombstones = self.tombstones.lock();
        let before = tombstones.len();
        tombstones.retain(|_, tombstone| now.saturating_sub(tombstone.recorded_at) < ttl);
        before - tombstones.len()
    }

    /// Decode and apply one received frame
    pub fn handle_frame(&self, frame: &[u8]) {
        let message = match ChannelMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("Ignoring undecodable consistency frame: {}", e);
                return;
            }
        };
        if message.sender() == self.origin {
            return;
        }
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        match message {
            ChannelMessage::Mutation { event, .. } => {
                self.apply_remote(event);
            }
            ChannelMessage::DigestRequest {
                sender,
                request_id,
                digests,
            } => self.answer_digest_request(sender, request_id, digests),
            ChannelMessage::DigestResponse {
                sender,
                request_id,
                to,
                digests,
            } => {
                if to == self.origin {
                    if let Some(responses) = self.responses.lock().get_mut(&request_id) {
                        responses.push((sender, digests));
                    }
                }
            }
        }
    }

    /// Apply a remote mutation idempotently. Returns true when the local
    /// store changed.
    pub fn apply_remote(&self, event: ConsistencyEvent) -> bool {
        self.observe(event.timestamp);
        let stamp = event.stamp();

        let shadowed = self
            .tombstones
            .lock()
            .get(&event.key)
            .map(|tombstone| tombstone.stamp >= stamp)
            .unwrap_or(false);
        if shadowed {
            self.stats.ignored_stale.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let applied = match (event.op, event.payload) {
            (MutationOp::Set, Some(payload)) => {
                self.apply_remote_set(&event.key, stamp, payload)
            }
            (MutationOp::Set, None) => self.remove_if_older(&event.key, stamp).then_some(None),
            (MutationOp::Delete, _) => {
                self.record_tombstone(&event.key, stamp);
                self.remove_if_older(&event.key, stamp).then_some(None)
            }
        };

        match applied {
            Some(dependencies) => {
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                log::debug!("Applied remote {} of {} from {}", event.op, event.key, stamp.origin);
                self.remote_changes.notify(&RemoteChange {
                    key: event.key,
                    op: event.op,
                    dependencies,
                });
                true
            }
            None => {
                self.stats.ignored_stale.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    fn apply_remote_set(
        &self,
        key: &CacheKey,
        stamp: WriteStamp,
        payload: EventPayload,
    ) -> Option<Option<Vec<CacheKey>>> {
        let remaining = payload
            .expires_at
            .saturating_sub(self.store.clock().now_millis());
        if remaining == 0 {
            log::debug!("Ignoring remote set of {} that expired at {}", key, payload.expires_at);
            return None;
        }

        let dependencies = payload.dependencies.clone();
        let request = WriteRequest {
            key: key.clone(),
            raw: payload.value,
            ttl: Duration::from_millis(remaining),
            dependencies: payload.dependencies.into_iter().collect(),
            priority: payload.priority,
            metadata: EntryMetadata {
                source: EntrySource::Remote,
                prefetched: payload.prefetched,
            },
            stamp,
            condition: WriteCondition::IfNewerStamp,
            preserve_identity: false,
        };

        match self.store.write(request) {
            Ok(WriteOutcome::Written(_)) => {
                self.tombstones.lock().remove(key);
                Some(Some(dependencies))
            }
            Ok(WriteOutcome::Discarded) => None,
            Err(e) => {
                log::warn!("Could not apply remote set of {}: {}", key, e);
                None
            }
        }
    }

    fn remove_if_older(&self, key: &CacheKey, stamp: WriteStamp) -> bool {
        match self.store.peek(key) {
            Some(entry) if entry.stamp < stamp => {
                self.store
                    .remove_if_version(key, entry.version, RemovalReason::Remote)
            }
            _ => false,
        }
    }

    /// Digests of every unexpired local entry plus live tombstones
    pub fn local_digests(&self) -> Vec<KeyDigest> {
        let mut digests: Vec<KeyDigest> = self
            .store
            .digests()
            .into_iter()
            .map(|digest| KeyDigest {
                key: digest.key,
                stamp: digest.stamp,
                checksum: Some(digest.checksum),
            })
            .collect();

        let present: BTreeSet<CacheKey> = digests.iter().map(|d| d.key.clone()).collect();
        let tombstones = self.tombstones.lock();
        digests.extend(
            tombstones
                .iter()
                .filter(|(key, _)| !present.contains(*key))
                .map(|(key, tombstone)| KeyDigest {
                    key: key.clone(),
                    stamp: tombstone.stamp,
                    checksum: None,
                }),
        );
        digests
    }

    fn answer_digest_request(&self, requester: Uuid, request_id: u64, theirs: Vec<KeyDigest>) {
        let theirs: HashMap<CacheKey, KeyDigest> = theirs
            .into_iter()
            .map(|digest| (digest.key.clone(), digest))
            .collect();
        let ours = self.local_digests();

        let mut pushed = 0;
        for digest in &ours {
            if compare_digests(Some(digest), theirs.get(&digest.key)) == Some(KeyState::LocalAhead)
                && self.push(digest)
            {
                pushed += 1;
            }
        }
        if pushed > 0 {
            log::debug!("Pushed {} newer entries to {}", pushed, requester);
        }

        self.send(&ChannelMessage::DigestResponse {
            sender: self.origin,
            request_id,
            to: requester,
            digests: ours,
        });
    }

    /// Re-send the local state behind a digest
    fn push(&self, digest: &KeyDigest) -> bool {
        let event = if digest.is_present() {
            match self.store.read_raw(&digest.key) {
                Some((value, entry)) if entry.stamp == digest.stamp => {
                    event_for_entry(&entry, value)
                }
                _ => return false,
            }
        } else {
            ConsistencyEvent {
                key: digest.key.clone(),
                op: MutationOp::Delete,
                timestamp: digest.stamp.timestamp,
                origin_id: digest.stamp.origin,
                payload: None,
            }
        };
        let sent = self.send(&ChannelMessage::Mutation {
            sender: self.origin,
            event,
        });
        if sent {
            self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Exchange digests with peers, push newer local state, and repair keys
    /// where a peer is ahead when the score falls below the threshold
    pub async fn force_consistency_check(&self, repairer: &dyn Repairer) -> ConsistencyReport {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);
        let mut report = ConsistencyReport::empty(self.store.clock().now_utc());
        if !self.config.enabled {
            return report;
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        self.responses.lock().insert(request_id, Vec::new());
        let request = ChannelMessage::DigestRequest {
            sender: self.origin,
            request_id,
            digests: self.local_digests(),
        };
        if !self.send(&request) {
            self.responses.lock().remove(&request_id);
            report.issues.push(ConsistencyIssue {
                key: None,
                error: CacheError::Channel("digest request could not be sent".to_string()),
            });
            return self.remember(report);
        }

        tokio::time::sleep(self.config.response_window).await;
        let responses = self.responses.lock().remove(&request_id).unwrap_or_default();
        report.peers_responded = responses.len();

        // Compare against the state after any pushes peers made meanwhile
        let local: HashMap<CacheKey, KeyDigest> = self
            .local_digests()
            .into_iter()
            .map(|digest| (digest.key.clone(), digest))
            .collect();

        let mut per_key: BTreeMap<CacheKey, KeyState> = BTreeMap::new();
        for (_, digests) in &responses {
            let theirs: HashMap<&CacheKey, &KeyDigest> =
                digests.iter().map(|digest| (&digest.key, digest)).collect();
            let keys: BTreeSet<&CacheKey> = local.keys().chain(theirs.keys().copied()).collect();
            for key in keys {
                if let Some(state) = compare_digests(local.get(key), theirs.get(key).copied()) {
                    let slot = per_key.entry(key.clone()).or_insert(state);
                    *slot = (*slot).max(state);
                }
            }
        }

        for (key, state) in &per_key {
            if *state == KeyState::LocalAhead {
                if let Some(digest) = local.get(key) {
                    if self.push(digest) {
                        report.pushed += 1;
                    }
                }
            }
        }

        report.overall_score = ConsistencyReport::score(&per_key);
        if report.overall_score < self.config.repair_threshold {
            for (key, state) in &per_key {
                if !state.needs_repair() {
                    continue;
                }
                self.stats.repairs.fetch_add(1, Ordering::Relaxed);
                match repairer.repair(key).await {
                    Ok(()) => report.repaired += 1,
                    Err(e) => {
                        self.stats.repair_failures.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Consistency repair of {} failed: {}", key, e);
                        report.issues.push(ConsistencyIssue {
                            key: Some(key.clone()),
                            error: CacheError::ConsistencyRepairFailure {
                                key: key.to_string(),
                                reason: e.to_string(),
                            },
                        });
                    }
                }
            }
        }

        report.per_key_state = per_key;
        log::debug!(
            "Consistency check: score {:.3} over {} keys, {} peers, {} pushed, {} repaired",
            report.overall_score,
            report.per_key_state.len(),
            report.peers_responded,
            report.pushed,
            report.repaired
        );
        self.remember(report)
    }

    fn remember(&self, report: ConsistencyReport) -> ConsistencyReport {
        *self.last_report.write() = Some(report.clone());
        report
    }

    pub fn last_report(&self) -> Option<ConsistencyReport> {
        self.last_report.read().clone()
    }

    pub fn stats(&self) -> ConsistencyStatsSnapshot {
        ConsistencyStatsSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            received: self.stats.received.load(Ordering::Relaxed),
            applied: self.stats.applied.load(Ordering::Relaxed),
            ignored_stale: self.stats.ignored_stale.load(Ordering::Relaxed),
            decode_errors: self.stats.decode_errors.load(Ordering::Relaxed),
            checks: self.stats.checks.load(Ordering::Relaxed),
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            repairs: self.stats.repairs.load(Ordering::Relaxed),
            repair_failures: self.stats.repair_failures.load(Ordering::Relaxed),
            tombstones: self.tombstones.lock().len(),
            last_score: self.last_report.read().as_ref().map(|r| r.overall_score),
        }
    }

    /// Spawn the receive loop and the periodic reconciliation loop
    pub fn start(
        self: &Arc<Self>,
        repairer: Arc<dyn Repairer>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut handles = Vec::new();

        if let Some(receiver) = self.receiver.lock().take() {
            let coordinator = Arc::clone(self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                coordinator.receive_loop(receiver, shutdown).await
            }));
        }

        let coordinator = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            coordinator.reconcile_loop(repairer, shutdown).await
        }));

        log::info!(
            "Consistency coordinator {} started on {} channel",
            self.origin,
            self.channel.name()
        );
        handles
    }

    async fn receive_loop(
        self: Arc<Self>,
        mut receiver: Box<dyn ChannelReceiver>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                frame = receiver.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => {
                        log::info!("Consistency channel closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn reconcile_loop(self: Arc<Self>, repairer: Arc<dyn Repairer>, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.check_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.purge_tombstones();
                    let report = self.force_consistency_check(repairer.as_ref()).await;
                    if report.overall_score < self.config.repair_threshold {
                        log::info!("Consistency score {:.3} below threshold", report.overall_score);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn event_for_entry(entry: &CacheEntry, value: Vec<u8>) -> ConsistencyEvent {
    ConsistencyEvent {
        key: entry.key.clone(),
        op: MutationOp::Set,
        timestamp: entry.stamp.timestamp,
        origin_id: entry.stamp.origin,
        payload: Some(EventPayload {
            value,
            expires_at: entry.expires_at,
            priority: entry.priority,
            dependencies: entry.dependencies.iter().cloned().collect(),
            prefetched: entry.metadata.prefetched,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::CacheConfig;
    use crate::store::Priority;

    struct NoRepair;

    #[async_trait]
    impl Repairer for NoRepair {
        async fn repair(&self, key: &CacheKey) -> CacheResult<()> {
            Err(CacheError::NoLoader(key.to_string()))
        }
    }

    fn context(hub: &InMemoryHub, now: u64) -> (Arc<ConsistencyCoordinator>, Arc<CacheStore>, Arc<ManualClock>) {
        let config = CacheConfig::for_testing();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(CacheStore::new(&config, clock.clone()));
        let coordinator = Arc::new(ConsistencyCoordinator::new(
            config.consistency.clone(),
            store.clone(),
            hub.channel(),
        ));
        (coordinator, store, clock)
    }

    fn write(coordinator: &ConsistencyCoordinator, store: &CacheStore, key: &CacheKey, value: &[u8]) {
        let stamp = coordinator.next_stamp();
        store
            .write(WriteRequest {
                key: key.clone(),
                raw: value.to_vec(),
                ttl: Duration::from_secs(60),
                dependencies: BTreeSet::new(),
                priority: Priority::Normal,
                metadata: EntryMetadata::default(),
                stamp,
                condition: WriteCondition::Always,
                preserve_identity: false,
            })
            .unwrap();
    }

    fn event(key: &CacheKey, op: MutationOp, timestamp: u64, origin: u128, value: &[u8]) -> ConsistencyEvent {
        ConsistencyEvent {
            key: key.clone(),
            op,
            timestamp,
            origin_id: Uuid::from_u128(origin),
            payload: (op == MutationOp::Set).then(|| EventPayload {
                value: value.to_vec(),
                expires_at: timestamp + 60_000,
                priority: Priority::Normal,
                dependencies: Vec::new(),
                prefetched: false,
            }),
        }
    }

    fn value_of(store: &CacheStore, key: &CacheKey) -> Option<Vec<u8>> {
        store.get(key).value.map(|value| value.to_vec())
    }

    #[test]
    fn test_hybrid_timestamps_are_monotonic() {
        let hub = InMemoryHub::new(16);
        let (coordinator, _store, clock) = context(&hub, 100);
        assert_eq!(coordinator.next_timestamp(), 100);
        assert_eq!(coordinator.next_timestamp(), 101);

        coordinator.observe(500);
        assert_eq!(coordinator.next_timestamp(), 501);

        clock.set(1_000);
        assert_eq!(coordinator.next_timestamp(), 1_000);
    }

    #[test]
    fn test_last_write_wins_regardless_of_arrival_order() {
        let hub = InMemoryHub::new(16);
        let key = CacheKey::new("stats", "x");
        let older = event(&key, MutationOp::Set, 100, 1, b"1");
        let newer = event(&key, MutationOp::Set, 105, 2, b"2");

        let (in_order, in_order_store, _) = context(&hub, 0);
        in_order.apply_remote(older.clone());
        in_order.apply_remote(newer.clone());

        let (reversed, reversed_store, _) = context(&hub, 0);
        reversed.apply_remote(newer.clone());
        assert!(!reversed.apply_remote(older));
        // idempotent
        assert!(!reversed.apply_remote(newer));

        assert_eq!(value_of(&in_order_store, &key), Some(b"2".to_vec()));
        assert_eq!(value_of(&reversed_store, &key), Some(b"2".to_vec()));
    }

    #[test]
    fn test_timestamp_ties_broken_by_origin() {
        let hub = InMemoryHub::new(16);
        let key = CacheKey::new("stats", "tie");
        let (coordinator, store, _) = context(&hub, 0);

        coordinator.apply_remote(event(&key, MutationOp::Set, 100, 9, b"high-origin"));
        coordinator.apply_remote(event(&key, MutationOp::Set, 100, 3, b"low-origin"));
        assert_eq!(value_of(&store, &key), Some(b"high-origin".to_vec()));
    }

    #[test]
    fn test_tombstone_blocks_late_older_set() {
        let hub = InMemoryHub::new(16);
        let key = CacheKey::new("stats", "gone");
        let (coordinator, store, _) = context(&hub, 0);

        coordinator.apply_remote(event(&key, MutationOp::Set, 100, 1, b"v"));
        assert!(coordinator.apply_remote(event(&key, MutationOp::Delete, 110, 2, b"")));
        assert!(!store.contains(&key));

        assert!(!coordinator.apply_remote(event(&key, MutationOp::Set, 105, 1, b"late")));
        assert!(!store.contains(&key));
        assert!(coordinator.apply_remote(event(&key, MutationOp::Set, 120, 1, b"newer")));
        assert!(store.contains(&key));
    }

    #[test]
    fn test_remote_changes_are_announced() {
        let hub = InMemoryHub::new(16);
        let key = CacheKey::new("stats", "x");
        let (coordinator, _store, _) = context(&hub, 0);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        coordinator.on_remote_change(move |change| sink.lock().push(change.op));

        coordinator.apply_remote(event(&key, MutationOp::Set, 100, 1, b"v"));
        coordinator.apply_remote(event(&key, MutationOp::Set, 50, 1, b"old"));
        coordinator.apply_remote(event(&key, MutationOp::Delete, 200, 1, b""));

        assert_eq!(*seen.lock(), vec![MutationOp::Set, MutationOp::Delete]);
    }

    #[test]
    fn test_remote_set_keeps_absolute_expiry() {
        let hub = InMemoryHub::new(16);
        let key = CacheKey::new("stats", "x");
        let (coordinator, store, clock) = context(&hub, 30_000);

        assert!(coordinator.apply_remote(event(&key, MutationOp::Set, 100, 1, b"v")));
        let entry = store.peek(&key).unwrap();
        assert_eq!(entry.expires_at, 60_100);
        assert_eq!(entry.ttl_ms, 30_100);

        clock.set(70_000);
        let expired = event(&CacheKey::new("stats", "late"), MutationOp::Set, 200, 1, b"v");
        assert!(!coordinator.apply_remote(expired));
        assert!(!store.contains(&CacheKey::new("stats", "late")));
        assert!(coordinator.local_digests().is_empty());
    }

    #[test]
    fn test_garbage_frames_are_counted_not_fatal() {
        let hub = InMemoryHub::new(16);
        let (coordinator, _store, _) = context(&hub, 0);
        coordinator.handle_frame(b"\x07garbage");
        assert_eq!(coordinator.stats().decode_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciliation_converges_after_lost_messages() {
        let hub = InMemoryHub::new(64);
        let key = CacheKey::new("stats", "x");
        let (a, a_store, _) = context(&hub, 100);
        let (b, b_store, _) = context(&hub, 105);
        let (_tx, rx) = watch::channel(false);
        a.start(Arc::new(NoRepair), rx.clone());
        b.start(Arc::new(NoRepair), rx);

        // writes happen but are never broadcast
        write(&a, &a_store, &key, b"1");
        write(&b, &b_store, &key, b"2");

        let first = a.force_consistency_check(&NoRepair).await;
        assert_eq!(first.peers_responded, 1);
        assert_eq!(value_of(&a_store, &key), Some(b"2".to_vec()));
        assert_eq!(value_of(&b_store, &key), Some(b"2".to_vec()));

        let again = a.force_consistency_check(&NoRepair).await;
        assert_eq!(again.overall_score, 1.0);
        assert!(again.issues.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_context_check_is_trivially_consistent() {
        let hub = InMemoryHub::new(16);
        let (coordinator, store, _) = context(&hub, 0);
        let (_tx, rx) = watch::channel(false);
        coordinator.start(Arc::new(NoRepair), rx);
        write(&coordinator, &store, &CacheKey::new("stats", "x"), b"1");

        let report = coordinator.force_consistency_check(&NoRepair).await;
        assert_eq!(report.overall_score, 1.0);
        assert_eq!(report.peers_responded, 0);
        assert_eq!(coordinator.last_report(), Some(report));
    }
}
