// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Refresh tasks and queue ordering

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::store::{CacheKey, Priority};

/// Why a refresh was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    /// A stale value was served
    Stale,
    /// A fresh hit was close to expiry
    RefreshAhead,
    /// Explicit `force_refresh`
    Forced,
    /// Repopulate a key removed by invalidation
    Repopulate,
    /// Reconciliation found a peer ahead of us
    Repair,
}

impl RefreshReason {
    /// Whether the key must still exist when the task runs
    pub fn requires_entry(&self) -> bool {
        matches!(self, RefreshReason::Stale | RefreshReason::RefreshAhead)
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefreshReason::Stale => "stale",
            RefreshReason::RefreshAhead => "refresh-ahead",
            RefreshReason::Forced => "forced",
            RefreshReason::Repopulate => "repopulate",
            RefreshReason::Repair => "repair",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTask {
    pub key: CacheKey,
    pub priority: Priority,
    pub reason: RefreshReason,
    /// Number of failed attempts so far
    pub attempt: u32,
    pub next_run_at: Instant,
    /// Delay applied before this attempt
    pub backoff: Duration,
    pub(crate) seq: u64,
}

/// Exponential backoff: `min(base * 2^attempt, max)`
pub fn backoff_for(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Ready-heap ordering: priority desc, `next_run_at` asc, then FIFO
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ReadyTask(pub RefreshTask);

impl Ord for ReadyTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.next_run_at.cmp(&self.0.next_run_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for ReadyTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Delay-heap ordering: earliest `next_run_at` first
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DelayedTask(pub RefreshTask);

impl Ord for DelayedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .next_run_at
            .cmp(&self.0.next_run_at)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

impl PartialOrd for DelayedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
