// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Background refresh: priority queue plus bounded worker pool
//!
//! Tasks wait in a delay heap until `next_run_at`, then move to a ready heap
//! ordered by priority. Workers pop from the ready heap only. Each key has at
//! most one queued task; a task popped by a worker is tracked as in flight
//! so that cancelling the key discards whatever the loader returns.

pub mod loader;
pub mod task;

pub use loader::{loader_fn, LoadContext, Loader, LoaderRegistry};
pub use task::{backoff_for, RefreshReason, RefreshTask};

use async_trait::async_trait;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RefreshConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{SubscriptionId, Subscribers};
use crate::store::{CacheKey, Priority};
use task::{DelayedTask, ReadyTask};

/// Decision taken right before a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStart {
    /// Run; write back only if the entry is still at `baseline`
    Proceed { baseline: Option<u64> },
    /// Drop the task without running it
    Skip,
}

/// Result of writing a loaded value back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    Applied,
    /// A newer write happened while the loader ran
    Superseded,
}

/// The cache side of a refresh, implemented by the manager
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    fn begin(&self, task: &RefreshTask) -> RefreshStart;

    async fn fetch(&self, key: &CacheKey) -> CacheResult<Vec<u8>>;

    fn complete(
        &self,
        task: &RefreshTask,
        baseline: Option<u64>,
        value: Vec<u8>,
    ) -> CacheResult<WriteBack>;
}

/// A task that exhausted its attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub key: CacheKey,
    pub reason: RefreshReason,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Default)]
struct RefreshStats {
    scheduled: AtomicU64,
    coalesced: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    discarded: AtomicU64,
    skipped: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshStatsSnapshot {
    pub scheduled: u64,
    pub coalesced: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub discarded: u64,
    pub skipped: u64,
    pub timeouts: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub suspended: bool,
}

#[derive(Debug, Clone, Copy)]
struct Queued {
    seq: u64,
    priority: Priority,
}

#[derive(Default)]
struct QueueState {
    delayed: BinaryHeap<DelayedTask>,
    ready: BinaryHeap<ReadyTask>,
    /// Live queued task per key; heap entries with another seq are stale
    queued: HashMap<CacheKey, Queued>,
    in_flight: HashMap<CacheKey, u64>,
    suspended: bool,
    next_seq: u64,
}

impl QueueState {
    fn is_live(&self, task: &RefreshTask) -> bool {
        self.queued
            .get(&task.key)
            .map(|queued| queued.seq == task.seq)
            .unwrap_or(false)
    }

    fn push(&mut self, task: RefreshTask) {
        self.queued.insert(
            task.key.clone(),
            Queued {
                seq: task.seq,
                priority: task.priority,
            },
        );
        self.delayed.push(DelayedTask(task));
    }

    fn promote(&mut self, now: Instant) {
        while let Some(top) = self.delayed.peek() {
            if top.0.next_run_at > now {
                break;
            }
            if let Some(DelayedTask(task)) = self.delayed.pop() {
                if self.is_live(&task) {
                    self.ready.push(ReadyTask(task));
                }
            }
        }
    }

    fn pop_ready(&mut self) -> Option<RefreshTask> {
        while let Some(ReadyTask(task)) = self.ready.pop() {
            if self.is_live(&task) {
                self.queued.remove(&task.key);
                self.in_flight.insert(task.key.clone(), task.seq);
                return Some(task);
            }
        }
        None
    }

    fn next_wake(&mut self) -> Option<Instant> {
        while let Some(top) = self.delayed.peek() {
            if self.is_live(&top.0) {
                return Some(top.0.next_run_at);
            }
            self.delayed.pop();
        }
        None
    }
}

/// Priority-ordered background refresher
pub struct BackgroundRefresher {
    config: RefreshConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    stats: RefreshStats,
    failures: Subscribers<RefreshFailure>,
}

impl BackgroundRefresher {
    pub fn new(config: RefreshConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stats: RefreshStats::default(),
            failures: Subscribers::new(),
        }
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Queue a refresh to run as soon as a worker is free.
    ///
    /// Returns false when the key already has a queued task of equal or
    /// higher priority, or a non-forced refresh is already running for it.
    pub fn schedule(&self, key: CacheKey, priority: Priority, reason: RefreshReason) -> bool {
        self.schedule_at(key, priority, reason, Instant::now())
    }

    pub fn schedule_at(
        &self,
        key: CacheKey,
        priority: Priority,
        reason: RefreshReason,
        run_at: Instant,
    ) -> bool {
        {
            let mut state = self.state.lock();
            if let Some(queued) = state.queued.get(&key) {
                if queued.priority >= priority {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            if state.in_flight.contains_key(&key) && reason != RefreshReason::Forced {
                self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                return false;
            }

            state.next_seq += 1;
            let task = RefreshTask {
                key,
                priority,
                reason,
                attempt: 0,
                next_run_at: run_at,
                backoff: Duration::ZERO,
                seq: state.next_seq,
            };
            log::debug!("Scheduled {} refresh of {} ({:?})", reason, task.key, priority);
            state.push(task);
        }

        self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        true
    }

    /// Drop the queued task for `key` and orphan any in-flight one
    pub fn cancel(&self, key: &CacheKey) -> bool {
        let cancelled = {
            let mut state = self.state.lock();
            let queued = state.queued.remove(key).is_some();
            let running = state.in_flight.remove(key).is_some();
            queued || running
        };
        if cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
            log::debug!("Cancelled refresh of {}", key);
        }
        cancelled
    }

    /// Drop a queued task but let a running one finish
    pub fn cancel_queued(&self, key: &CacheKey) -> bool {
        let cancelled = self.state.lock().queued.remove(key).is_some();
        if cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.queued.len() + state.in_flight.len();
        state.queued.clear();
        state.in_flight.clear();
        state.delayed.clear();
        state.ready.clear();
        self.stats
            .cancelled
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn is_queued(&self, key: &CacheKey) -> bool {
        self.state.lock().queued.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    /// Stop handing out tasks; running tasks finish normally
    pub fn suspend(&self) {
        self.state.lock().suspended = true;
        log::info!("Background refresh suspended");
    }

    pub fn resume(&self) {
        self.state.lock().suspended = false;
        log::info!("Background refresh resumed");
        self.notify.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn on_failure<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&RefreshFailure) + Send + Sync + 'static,
    {
        self.failures.subscribe(handler)
    }

    pub fn unsubscribe_failure(&self, id: SubscriptionId) -> bool {
        self.failures.unsubscribe(id)
    }

    pub fn stats(&self) -> RefreshStatsSnapshot {
        let (queue_depth, in_flight, suspended) = {
            let state = self.state.lock();
            (state.queued.len(), state.in_flight.len(), state.suspended)
        };
        RefreshStatsSnapshot {
            scheduled: self.stats.scheduled.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retried: self.stats.retried.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            discarded: self.stats.discarded.load(Ordering::Relaxed),
            skipped: self.stats.skipped.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            queue_depth,
            in_flight,
            suspended,
        }
    }

    /// Spawn `max_concurrent_refreshes` workers on the current runtime
    pub fn start(
        self: &Arc<Self>,
        handler: Arc<dyn RefreshHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let workers = self.config.max_concurrent_refreshes.max(1);
        log::info!("Starting {} refresh workers", workers);

        (0..workers)
            .map(|id| {
                let refresher = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { refresher.worker_loop(id, handler, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(
        self: Arc<Self>,
        id: usize,
        handler: Arc<dyn RefreshHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let task = tokio::select! {
                task = self.next_task() => task,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.run_task(task, &handler).await;
        }
        log::debug!("Refresh worker {} stopped", id);
    }

    async fn next_task(&self) -> RefreshTask {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.state.lock();
                state.promote(Instant::now());
                if !state.suspended {
                    if let Some(task) = state.pop_ready() {
                        return task;
                    }
                }
                state.next_wake()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Run one attempt of a dequeued task. The loader runs on its own tokio
    /// task so a panic inside it fails the attempt, not the worker.
    pub(crate) async fn run_task(&self, task: RefreshTask, handler: &Arc<dyn RefreshHandler>) {
        let baseline = match handler.begin(&task) {
            RefreshStart::Proceed { baseline } => baseline,
            RefreshStart::Skip => {
                self.finish(&task);
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Skipped refresh of {}: entry gone", task.key);
                return;
            }
        };

        let fetch = {
            let handler = Arc::clone(handler);
            let key = task.key.clone();
            tokio::spawn(async move { handler.fetch(&key).await })
        };
        let abort = fetch.abort_handle();

        let timeout = self.config.task_timeout;
        let loaded = match tokio::time::timeout(timeout, fetch).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("Loader for {} did not complete: {}", task.key, e);
                Err(CacheError::loader(format!("loader panicked: {}", e)))
            }
            Err(_) => {
                abort.abort();
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(CacheError::Timeout(timeout))
            }
        };

        if !self.finish(&task) {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            log::debug!("Discarded refresh result for {}: cancelled", task.key);
            return;
        }

        let error = match loaded.and_then(|value| handler.complete(&task, baseline, value)) {
            Ok(WriteBack::Applied) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                log::debug!("Refreshed {}", task.key);
                return;
            }
            Ok(WriteBack::Superseded) => {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!("Discarded refresh result for {}: newer write", task.key);
                return;
            }
            Err(e) => e,
        };

        self.retry_or_fail(task, error);
    }

    /// Clears the in-flight marker; false if the task was cancelled meanwhile
    fn finish(&self, task: &RefreshTask) -> bool {
        let mut state = self.state.lock();
        match state.in_flight.get(&task.key) {
            Some(seq) if *seq == task.seq => {
                state.in_flight.remove(&task.key);
                true
            }
            _ => false,
        }
    }

    fn retry_or_fail(&self, task: RefreshTask, error: CacheError) {
        let attempts = task.attempt + 1;
        if attempts >= self.config.max_attempts {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Refresh of {} failed after {} attempts: {}",
                task.key,
                attempts,
                error
            );
            self.failures.notify(&RefreshFailure {
                key: task.key,
                reason: task.reason,
                attempts,
                error: error.to_string(),
            });
            return;
        }

        let backoff = backoff_for(task.attempt, self.config.base_backoff, self.config.max_backoff);
        let requeued = {
            let mut state = self.state.lock();
            if state.queued.contains_key(&task.key) {
                // A newer task for the key superseded this one
                false
            } else {
                state.next_seq += 1;
                let seq = state.next_seq;
                state.push(RefreshTask {
                    attempt: attempts,
                    next_run_at: Instant::now() + backoff,
                    backoff,
                    seq,
                    ..task.clone()
                });
                true
            }
        };

        if requeued {
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Refresh of {} failed (attempt {}), retrying in {:?}: {}",
                task.key,
                attempts,
                backoff,
                error
            );
            self.notify.notify_waiters();
        }
    }
}
