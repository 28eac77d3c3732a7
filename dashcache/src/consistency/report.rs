// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Reconciliation reports

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::channel::KeyDigest;
use crate::error::CacheError;
use crate::store::CacheKey;

/// How a key compares between this context and its peers.
/// Later variants are worse; the worst comparison across peers wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyState {
    Consistent,
    /// This context holds the newer state and pushes it to peers
    LocalAhead,
    /// Same stamp, different bytes
    Diverged,
    /// A peer holds newer state
    PeerAhead,
}

impl KeyState {
    pub fn needs_repair(&self) -> bool {
        matches!(self, KeyState::PeerAhead | KeyState::Diverged)
    }
}

/// Compare one key; `None` when neither side holds a value
pub fn compare_digests(local: Option<&KeyDigest>, peer: Option<&KeyDigest>) -> Option<KeyState> {
    let local_present = local.map(KeyDigest::is_present).unwrap_or(false);
    let peer_present = peer.map(KeyDigest::is_present).unwrap_or(false);
    if !local_present && !peer_present {
        return None;
    }

    let local_stamp = local.map(|digest| digest.stamp);
    let peer_stamp = peer.map(|digest| digest.stamp);
    let state = if local_stamp > peer_stamp {
        KeyState::LocalAhead
    } else if peer_stamp > local_stamp {
        KeyState::PeerAhead
    } else if local.map(|d| d.checksum) == peer.map(|d| d.checksum) {
        KeyState::Consistent
    } else {
        KeyState::Diverged
    };
    Some(state)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyIssue {
    pub key: Option<CacheKey>,
    pub error: CacheError,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    /// consistent keys / compared keys; 1.0 when nothing was compared
    pub overall_score: f64,
    pub per_key_state: BTreeMap<CacheKey, KeyState>,
    pub issues: Vec<ConsistencyIssue>,
    pub timestamp: DateTime<Utc>,
    pub peers_responded: usize,
    pub pushed: usize,
    pub repaired: usize,
}

impl ConsistencyReport {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            overall_score: 1.0,
            per_key_state: BTreeMap::new(),
            issues: Vec::new(),
            timestamp,
            peers_responded: 0,
            pushed: 0,
            repaired: 0,
        }
    }

    pub fn inconsistent_keys(&self) -> Vec<&CacheKey> {
        self.per_key_state
            .iter()
            .filter(|(_, state)| **state != KeyState::Consistent)
            .map(|(key, _)| key)
            .collect()
    }

    pub fn is_converged(&self) -> bool {
        self.overall_score >= 1.0
    }

    pub(crate) fn score(per_key_state: &BTreeMap<CacheKey, KeyState>) -> f64 {
        if per_key_state.is_empty() {
            return 1.0;
        }
        let consistent = per_key_state
            .values()
            .filter(|state| **state == KeyState::Consistent)
            .count();
        consistent as f64 / per_key_state.len() as f64
    }
}
