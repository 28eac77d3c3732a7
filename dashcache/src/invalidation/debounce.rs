// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Per-event-key coalescing of debounced invalidations

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;

use crate::store::CacheKey;

/// Targets collected for one event key during a window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingBatch {
    pub targets: BTreeSet<CacheKey>,
    /// Events folded into this batch
    pub events: u64,
}

#[derive(Debug, Default)]
pub struct Debouncer {
    pending: Mutex<HashMap<CacheKey, PendingBatch>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add targets for `event_key`. Returns true when this opened a new
    /// window, i.e. the caller must arrange a flush.
    pub fn submit(&self, event_key: &CacheKey, targets: impl IntoIterator<Item = CacheKey>) -> bool {
        let mut pending = self.pending.lock();
        let opened = !pending.contains_key(event_key);
        let batch = pending.entry(event_key.clone()).or_default();
        batch.targets.extend(targets);
        batch.events += 1;
        opened
    }

    pub fn take(&self, event_key: &CacheKey) -> Option<PendingBatch> {
        self.pending.lock().remove(event_key)
    }

    pub fn take_all(&self) -> Vec<(CacheKey, PendingBatch)> {
        self.pending.lock().drain().collect()
    }

    pub fn pending_events(&self) -> usize {
        self.pending.lock().len()
    }
}
