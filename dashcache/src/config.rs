// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Cache configuration and policies

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Top-level cache configuration, injected into a [`crate::CacheManager`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable/disable caching entirely
    pub enabled: bool,

    /// Maximum bytes held by stored values
    pub max_memory_bytes: usize,

    /// Maximum number of entries
    pub max_entries: usize,

    /// Absolute cap for a single value (uncompressed)
    pub max_entry_bytes: usize,

    /// TTL used when neither the caller nor the TTL engine supplies one
    pub default_ttl: Duration,

    /// Serve expired entries flagged as stale while a refresh runs
    pub serve_stale: bool,

    /// How long past expiry an entry may still be served stale
    pub stale_grace: Duration,

    /// Fresh hits with less than this fraction of their TTL left are refreshed ahead
    pub refresh_ahead_ratio: f64,

    /// Maximum retained cache events
    pub max_events: usize,

    pub compression: CompressionConfig,
    pub ttl: TtlConfig,
    pub refresh: RefreshConfig,
    pub invalidation: InvalidationConfig,
    pub consistency: ConsistencyConfig,
    pub optimizer: OptimizerConfig,
}

/// Value compression settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// Values larger than this are compressed
    pub threshold_bytes: usize,
    /// zlib level (0-9)
    pub level: u32,
}

/// Adaptive TTL inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Base TTL per data type
    pub base_ttls: HashMap<String, Duration>,
    /// Base TTL for unknown data types
    pub default_base: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// Business hours window [start, end) in local hours
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    /// Only Monday-Friday count as business days
    pub weekdays_only: bool,
    /// Offset of the business-hours timezone from UTC
    pub utc_offset_minutes: i32,
    pub high_activity_threshold: f64,
    pub high_load_threshold: f64,
    /// Multiplier while users are actively changing data
    pub high_activity_factor: f64,
    pub business_hours_factor: f64,
    pub off_hours_factor: f64,
    /// Multiplier while the backend is under load
    pub high_load_factor: f64,
}

/// Background refresh worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub max_concurrent_refreshes: usize,
    /// Total loader invocations per task before giving up
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-attempt loader timeout
    pub task_timeout: Duration,
}

/// Invalidation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Window in which debounced events for the same key are coalesced
    pub debounce_window: Duration,
    pub max_cascade_depth: usize,
    /// Reload invalidated keys that have a known loader
    pub refetch_on_invalidate: bool,
    pub max_history: usize,
}

/// Cross-context consistency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub enabled: bool,
    /// Period of the reconciliation tick
    pub check_interval: Duration,
    /// How long a consistency check waits for peer digests
    pub response_window: Duration,
    /// Below this score inconsistent keys are reloaded
    pub repair_threshold: f64,
    /// How long delete tombstones are remembered
    pub tombstone_ttl: Duration,
    /// Buffer size of the in-memory transport
    pub channel_capacity: usize,
}

/// Memory pressure optimizer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Pressure above which the optimizer evicts
    pub high_watermark: f64,
    /// Pressure the optimizer evicts down to (exclusive)
    pub low_watermark: f64,
    pub aggressive_threshold_bytes: usize,
    pub aggressive_level: u32,
    pub max_history: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_bytes: 1024 * 1024 * 64, // 64MB
            max_entries: 10_000,
            max_entry_bytes: 1024 * 1024 * 4, // 4MB
            default_ttl: Duration::from_secs(300),
            serve_stale: true,
            stale_grace: Duration::from_secs(600),
            refresh_ahead_ratio: 0.1,
            max_events: 10_000,
            compression: CompressionConfig::default(),
            ttl: TtlConfig::default(),
            refresh: RefreshConfig::default(),
            invalidation: InvalidationConfig::default(),
            consistency: ConsistencyConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 4 * 1024,
            level: 3,
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        let base_ttls = [
            ("stats", 60),
            ("dashboard", 120),
            ("feed", 30),
            ("users", 600),
            ("reference", 3600),
        ]
        .into_iter()
        .map(|(name, secs)| (name.to_string(), Duration::from_secs(secs)))
        .collect();

        Self {
            base_ttls,
            default_base: Duration::from_secs(300),
            min_ttl: Duration::from_secs(5),
            max_ttl: Duration::from_secs(6 * 3600),
            business_hours_start: 8,
            business_hours_end: 18,
            weekdays_only: true,
            utc_offset_minutes: 0,
            high_activity_threshold: 0.7,
            high_load_threshold: 0.8,
            high_activity_factor: 0.5,
            business_hours_factor: 0.75,
            off_hours_factor: 1.5,
            high_load_factor: 2.0,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            max_concurrent_refreshes: 4,
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            task_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(250),
            max_cascade_depth: 16,
            refetch_on_invalidate: true,
            max_history: 1000,
        }
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(30),
            response_window: Duration::from_millis(200),
            repair_threshold: 0.95,
            tombstone_ttl: Duration::from_secs(600),
            channel_capacity: 1024,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(15),
            high_watermark: 0.9,
            low_watermark: 0.8,
            aggressive_threshold_bytes: 512,
            aggressive_level: 9,
            max_history: 100,
        }
    }
}

impl CacheConfig {
    /// Create configuration optimized for read-heavy dashboards
    pub fn read_optimized() -> Self {
        Self {
            max_entries: 20_000,
            default_ttl: Duration::from_secs(600),
            refresh_ahead_ratio: 0.2,
            ..Self::default()
        }
    }

    /// Create configuration optimized for write-heavy workloads
    pub fn write_optimized() -> Self {
        let mut config = Self::default();
        config.default_ttl = Duration::from_secs(60);
        config.invalidation.debounce_window = Duration::from_millis(500);
        config.refresh_ahead_ratio = 0.0;
        config
    }

    /// Create configuration for memory-constrained environments
    pub fn memory_constrained() -> Self {
        let mut config = Self::default();
        config.max_memory_bytes = 1024 * 1024 * 8; // 8MB
        config.max_entries = 2_000;
        config.max_entry_bytes = 1024 * 512;
        config.compression.enabled = true;
        config.compression.threshold_bytes = 1024;
        config.compression.level = 6;
        config.optimizer.interval = Duration::from_secs(5);
        config
    }

    /// Small, quiet configuration for tests: no periodic services fire on their own
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.max_memory_bytes = 1024 * 1024;
        config.max_entries = 1_000;
        config.max_entry_bytes = 256 * 1024;
        config.max_events = 1_000;
        config.refresh.base_backoff = Duration::from_millis(10);
        config.refresh.max_backoff = Duration::from_millis(200);
        config.refresh.task_timeout = Duration::from_secs(1);
        config.invalidation.debounce_window = Duration::from_millis(50);
        config.consistency.check_interval = Duration::from_secs(3600);
        config.consistency.response_window = Duration::from_millis(50);
        config.optimizer.interval = Duration::from_secs(3600);
        config
    }

    /// Load a (possibly partial) JSON configuration
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CacheError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> CacheResult<()> {
        if self.max_memory_bytes == 0 || self.max_entries == 0 {
            return Err(CacheError::config(
                "max_memory_bytes and max_entries must be > 0",
            ));
        }

        if self.max_entry_bytes == 0 || self.max_entry_bytes > self.max_memory_bytes {
            return Err(CacheError::config(format!(
                "max_entry_bytes ({}) must be in 1..={}",
                self.max_entry_bytes, self.max_memory_bytes
            )));
        }

        if self.default_ttl.is_zero() {
            return Err(CacheError::config("default_ttl must be > 0"));
        }

        if !(0.0..=1.0).contains(&self.refresh_ahead_ratio) {
            return Err(CacheError::config("refresh_ahead_ratio must be in [0, 1]"));
        }

        if self.compression.level > 9 || self.optimizer.aggressive_level > 9 {
            return Err(CacheError::config("compression levels must be in 0..=9"));
        }

        if self.ttl.min_ttl < Duration::from_millis(1) {
            return Err(CacheError::config("ttl.min_ttl must be at least 1ms"));
        }

        if self.ttl.min_ttl > self.ttl.max_ttl {
            return Err(CacheError::config(format!(
                "min_ttl ({:?}) exceeds max_ttl ({:?})",
                self.ttl.min_ttl, self.ttl.max_ttl
            )));
        }

        // start > end is a window that wraps past midnight
        if self.ttl.business_hours_start >= 24
            || self.ttl.business_hours_end > 24
            || self.ttl.business_hours_start == self.ttl.business_hours_end
        {
            return Err(CacheError::config(
                "business hours need start < 24, end <= 24 and start != end",
            ));
        }

        if self.refresh.max_concurrent_refreshes == 0 || self.refresh.max_attempts == 0 {
            return Err(CacheError::config(
                "refresh workers and attempts must be > 0",
            ));
        }

        if self.refresh.base_backoff > self.refresh.max_backoff {
            return Err(CacheError::config("base_backoff exceeds max_backoff"));
        }

        if self.refresh.task_timeout.is_zero() {
            return Err(CacheError::config("refresh.task_timeout must be > 0"));
        }

        if self.optimizer.interval.is_zero() {
            return Err(CacheError::config("optimizer.interval must be > 0"));
        }

        if self.consistency.check_interval.is_zero() || self.consistency.response_window.is_zero() {
            return Err(CacheError::config(
                "consistency check_interval and response_window must be > 0",
            ));
        }

        let low = self.optimizer.low_watermark;
        let high = self.optimizer.high_watermark;
        if !(0.0 < low && low < high && high <= 1.0) {
            return Err(CacheError::config(format!(
                "watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                low, high
            )));
        }

        if !(0.0..=1.0).contains(&self.consistency.repair_threshold) {
            return Err(CacheError::config("repair_threshold must be in [0, 1]"));
        }

        if self.consistency.channel_capacity == 0 {
            return Err(CacheError::config("channel_capacity must be > 0"));
        }

        Ok(())
    }
}
