// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Typed observer subscriptions and the cache event log

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::store::CacheKey;

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of typed observers for one kind of notification
pub struct Subscribers<T> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Deliver to every observer. Handlers run outside the lock; a panicking
    /// handler is logged and skipped.
    pub fn notify(&self, value: &T) {
        let handlers: Vec<Handler<T>> = self
            .handlers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                log::error!("Cache observer panicked; notification skipped");
            }
        }
    }
}

/// Cache events for monitoring and debugging
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Hit {
        key: CacheKey,
        stale: bool,
        timestamp: u64,
    },
    Miss {
        key: CacheKey,
        timestamp: u64,
    },
    Write {
        key: CacheKey,
        size_bytes: usize,
        compressed: bool,
        timestamp: u64,
    },
    WriteRejected {
        key: CacheKey,
        reason: String,
        timestamp: u64,
    },
    Eviction {
        keys: Vec<CacheKey>,
        reason: String,
        timestamp: u64,
    },
    Invalidation {
        removed: usize,
        preserved: usize,
        trigger: String,
        timestamp: u64,
    },
    RefreshScheduled {
        key: CacheKey,
        reason: String,
        timestamp: u64,
    },
    RefreshFailed {
        key: CacheKey,
        error: String,
        timestamp: u64,
    },
    RemoteApplied {
        key: CacheKey,
        op: String,
        timestamp: u64,
    },
    CorruptEntryPurged {
        key: CacheKey,
        timestamp: u64,
    },
}

/// Bounded ring buffer of recent events
pub struct EventLog {
    events: Mutex<VecDeque<CacheEvent>>,
    max_events: usize,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    pub fn record(&self, event: CacheEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<CacheEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
