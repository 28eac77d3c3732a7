// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Aggregated cache statistics and health assessment

use crate::consistency::ConsistencyStatsSnapshot;
use crate::invalidation::InvalidationStatsSnapshot;
use crate::refresh::RefreshStatsSnapshot;
use crate::store::StoreStatsSnapshot;

/// Comprehensive cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub memory_usage: usize,
    pub max_memory: usize,
    pub entry_count: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub corrupt_purges: u64,
    pub rejected_writes: u64,
    pub writes: u64,
    pub refresh: RefreshStatsSnapshot,
    pub invalidation: InvalidationStatsSnapshot,
    pub consistency: ConsistencyStatsSnapshot,
}

impl CacheStatsSnapshot {
    pub(crate) fn assemble(
        store: StoreStatsSnapshot,
        refresh: RefreshStatsSnapshot,
        invalidation: InvalidationStatsSnapshot,
        consistency: ConsistencyStatsSnapshot,
    ) -> Self {
        Self {
            hits: store.hits,
            stale_hits: store.stale_hits,
            misses: store.misses,
            hit_rate: store.hit_rate(),
            miss_rate: store.miss_rate(),
            memory_usage: store.used_bytes,
            max_memory: store.max_memory_bytes,
            entry_count: store.entry_count,
            evictions: store.evictions,
            expirations: store.expirations,
            corrupt_purges: store.corrupt_purges,
            rejected_writes: store.rejected_writes,
            writes: store.writes,
            refresh,
            invalidation,
            consistency,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.hits + self.stale_hits + self.misses
    }

    pub fn memory_utilization(&self) -> f64 {
        if self.max_memory == 0 {
            0.0
        } else {
            self.memory_usage as f64 / self.max_memory as f64
        }
    }

    /// Evictions per request
    pub fn eviction_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.evictions as f64 / total as f64
        }
    }

    pub fn average_entry_bytes(&self) -> f64 {
        if self.entry_count == 0 {
            0.0
        } else {
            self.memory_usage as f64 / self.entry_count as f64
        }
    }
}

/// Cache health assessment
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHealthScore {
    pub overall: f64,
    pub hit_rate: f64,
    pub memory_efficiency: f64,
    pub eviction_health: f64,
    pub recommendations: Vec<String>,
}

impl CacheHealthScore {
    /// Weighted average: hit rate 50%, memory 30%, evictions 20%
    pub fn assess(stats: &CacheStatsSnapshot) -> Self {
        let hit_rate_score = stats.hit_rate;

        let utilization = stats.memory_utilization();
        let memory_score = if utilization > 0.9 {
            0.5
        } else if utilization > 0.7 {
            0.8
        } else {
            1.0
        };

        let eviction_score = (1.0 - stats.eviction_rate().min(1.0)).max(0.0);
        let overall = (hit_rate_score * 0.5) + (memory_score * 0.3) + (eviction_score * 0.2);

        Self {
            overall,
            hit_rate: hit_rate_score,
            memory_efficiency: memory_score,
            eviction_health: eviction_score,
            recommendations: recommendations(stats),
        }
    }
}

fn recommendations(stats: &CacheStatsSnapshot) -> Vec<String> {
    let mut recommendations = Vec::new();
    let requests = stats.total_requests();

    if requests > 0 && stats.hit_rate < 0.3 {
        recommendations.push(
            "Hit rate is low (<30%). Consider longer base TTLs or registering loaders for refresh-ahead."
                .to_string(),
        );
    }

    if stats.eviction_rate() > 0.1 {
        recommendations.push(
            "High eviction rate (>10%). Consider increasing memory limits or shortening TTLs."
                .to_string(),
        );
    }

    if stats.memory_utilization() > 0.9 {
        recommendations.push(
            "Memory utilization is high (>90%). Consider increasing max memory or enabling compression."
                .to_string(),
        );
    }

    if requests > 0 && stats.stale_hits as f64 / requests as f64 > 0.25 {
        recommendations.push(
            "Over 25% of hits are stale. Consider more refresh workers or a higher refresh-ahead ratio."
                .to_string(),
        );
    }

    if stats.refresh.failed > 0 {
        recommendations.push(format!(
            "{} background refreshes failed after retries. Check loader health.",
            stats.refresh.failed
        ));
    }

    if let Some(score) = stats.consistency.last_score {
        if score < 1.0 {
            recommendations.push(format!(
                "Last consistency check scored {:.2}. Peers have not converged.",
                score
            ));
        }
    }

    recommendations
}
