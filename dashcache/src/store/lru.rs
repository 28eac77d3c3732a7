// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! LRU victim selection

use std::sync::Arc;

use super::entry::{CacheKey, StoredEntry};

/// Victims chosen for eviction, in eviction order
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct EvictionPlan {
    pub victims: Vec<CacheKey>,
    pub bytes_freed: usize,
}

/// Picks the shortest LRU prefix of evictable entries that satisfies
/// `satisfied(bytes_freed, entries_freed)`.
///
/// Pinned entries and `exclude` are never candidates. Non-prefetched entries
/// go before prefetched ones; within each group, least recently used first.
/// Returns `None` when even evicting every candidate is not enough.
pub(crate) fn plan_eviction<'a, I, F>(
    entries: I,
    exclude: Option<&CacheKey>,
    satisfied: F,
) -> Option<EvictionPlan>
where
    I: IntoIterator<Item = &'a Arc<StoredEntry>>,
    F: Fn(usize, usize) -> bool,
{
    let mut plan = EvictionPlan::default();
    if satisfied(0, 0) {
        return Some(plan);
    }

    let mut candidates: Vec<&Arc<StoredEntry>> = entries
        .into_iter()
        .filter(|entry| !entry.priority.is_pinned())
        .filter(|entry| exclude != Some(&entry.key))
        .collect();
    candidates.sort_by_key(|entry| (entry.metadata.prefetched, entry.tick()));

    for entry in candidates {
        plan.victims.push(entry.key.clone());
        plan.bytes_freed += entry.size_bytes();
        if satisfied(plan.bytes_freed, plan.victims.len()) {
            return Some(plan);
        }
    }

    None
}

/// Every evictable entry, in eviction order
pub(crate) fn all_evictable<'a, I>(entries: I) -> EvictionPlan
where
    I: IntoIterator<Item = &'a Arc<StoredEntry>>,
{
    let mut candidates: Vec<&Arc<StoredEntry>> = entries
        .into_iter()
        .filter(|entry| !entry.priority.is_pinned())
        .collect();
    candidates.sort_by_key(|entry| (entry.metadata.prefetched, entry.tick()));

    EvictionPlan {
        bytes_freed: candidates.iter().map(|entry| entry.size_bytes()).sum(),
        victims: candidates.into_iter().map(|entry| entry.key.clone()).collect(),
    }
}

/// Bytes that eviction could free at most
pub(crate) fn evictable_bytes<'a, I>(entries: I, exclude: Option<&CacheKey>) -> usize
where
    I: IntoIterator<Item = &'a Arc<StoredEntry>>,
{
    entries
        .into_iter()
        .filter(|entry| !entry.priority.is_pinned())
        .filter(|entry| exclude != Some(&entry.key))
        .map(|entry| entry.size_bytes())
        .sum()
}
