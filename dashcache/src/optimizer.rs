// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Memory pressure optimizer
//!
//! Runs on a timer (or on demand): purges entries that can no longer be
//! served, evicts down to the low watermark when pressure exceeds the high
//! watermark, and escalates compression for new writes while under pressure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::OptimizerConfig;
use crate::events::{SubscriptionId, Subscribers};
use crate::store::{CacheStore, CompressionProfile, RemovalReason};

/// Why an optimization run happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationReason {
    /// Timer tick, pressure within bounds
    Scheduled,
    /// Requested through the manager
    Manual,
    /// Pressure exceeded the high watermark
    MemoryPressure,
}

impl std::fmt::Display for OptimizationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizationReason::Scheduled => f.write_str("scheduled"),
            OptimizationReason::Manual => f.write_str("manual"),
            OptimizationReason::MemoryPressure => f.write_str("memory_pressure"),
        }
    }
}

/// Stats record for one optimizer run
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationRun {
    pub entries_evicted: usize,
    pub bytes_freed: usize,
    pub expired_purged: usize,
    pub duration_ms: u64,
    pub reason: OptimizationReason,
    pub pressure_before: f64,
    pub pressure_after: f64,
    /// The aggressive compression profile is active after this run
    pub compression_escalated: bool,
}

pub struct MemoryOptimizer {
    config: OptimizerConfig,
    store: Arc<CacheStore>,
    baseline: CompressionProfile,
    escalated: AtomicBool,
    history: Mutex<VecDeque<OptimizationRun>>,
    observers: Subscribers<OptimizationRun>,
}

impl MemoryOptimizer {
    pub fn new(config: OptimizerConfig, store: Arc<CacheStore>) -> Self {
        let baseline = store.compression_profile();
        Self {
            config,
            store,
            baseline,
            escalated: AtomicBool::new(false),
            history: Mutex::new(VecDeque::new()),
            observers: Subscribers::new(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }

    fn aggressive_profile(&self) -> CompressionProfile {
        CompressionProfile {
            enabled: true,
            threshold_bytes: self
                .baseline
                .threshold_bytes
                .min(self.config.aggressive_threshold_bytes),
            level: self.config.aggressive_level.max(self.baseline.level),
        }
    }

    /// One optimization pass
    pub fn run_once(&self, requested: OptimizationReason) -> OptimizationRun {
        let started = StdInstant::now();
        let pressure_before = self.store.pressure();

        let expired = self.store.purge_expired();
        let mut reason = requested;
        let mut evicted = Vec::new();
        let mut bytes_freed = expired.bytes_freed;

        if self.store.pressure() > self.config.high_watermark {
            reason = OptimizationReason::MemoryPressure;
            let target = (self.config.low_watermark * self.store.max_memory_bytes() as f64) as usize;
            let report = self.store.evict_below(target, RemovalReason::Pressure);
            bytes_freed += report.bytes_freed;
            evicted = report.keys;

            if !self.escalated.swap(true, Ordering::SeqCst) {
                self.store.set_compression_profile(self.aggressive_profile());
                log::info!("Memory pressure {:.2}: aggressive compression enabled", pressure_before);
            }
        } else if self.store.pressure() < self.config.low_watermark
            && self.escalated.swap(false, Ordering::SeqCst)
        {
            self.store.set_compression_profile(self.baseline);
            log::info!("Memory pressure relieved: baseline compression restored");
        }

        let run = OptimizationRun {
            entries_evicted: evicted.len(),
            bytes_freed,
            expired_purged: expired.keys.len(),
            duration_ms: started.elapsed().as_millis() as u64,
            reason,
            pressure_before,
            pressure_after: self.store.pressure(),
            compression_escalated: self.is_escalated(),
        };

        if run.entries_evicted > 0 {
            log::info!(
                "Memory optimizer evicted {} entries ({} bytes), pressure {:.2} -> {:.2}",
                run.entries_evicted,
                run.bytes_freed,
                run.pressure_before,
                run.pressure_after
            );
        }
        if run.pressure_after > self.config.low_watermark && reason == OptimizationReason::MemoryPressure {
            log::warn!(
                "Pressure still {:.2} after eviction; remaining entries are pinned",
                run.pressure_after
            );
        }

        self.remember(run.clone());
        self.observers.notify(&run);
        run
    }

    fn remember(&self, run: OptimizationRun) {
        if self.config.max_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        if history.len() >= self.config.max_history {
            history.pop_front();
        }
        history.push_back(run);
    }

    /// Most recent first
    pub fn history(&self, limit: usize) -> Vec<OptimizationRun> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn on_optimization<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&OptimizationRun) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Spawn the periodic optimizer loop
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            return None;
        }
        let optimizer = Arc::clone(self);
        let period = self.config.interval;
        Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            log::info!("Memory optimizer started (interval {:?})", period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        optimizer.run_once(OptimizationReason::Scheduled);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            log::info!("Memory optimizer stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }
}
