// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Dashcache - adaptive caching and invalidation engine
//!
//! Dashcache is the data-layer cache behind dashboard-style applications.
//!
//! # Features
//!
//! - **Bounded store**: namespace/key entries with minimal LRU eviction,
//!   pinning and transparent zlib compression
//! - **Adaptive TTLs**: freshness derived from data type, business hours,
//!   user activity and system load
//! - **Background refresh**: stale-while-revalidate and refresh-ahead on a
//!   bounded, priority-ordered worker pool with retry and backoff
//! - **Selective invalidation**: rules, an explicit dependency graph,
//!   cascades with preserved keys, and debouncing
//! - **Cross-context consistency**: last-write-wins broadcast plus periodic
//!   digest reconciliation and auto-repair
//! - **Memory optimizer**: watermark-driven eviction and compression escalation
//!
//! # Usage
//!
//! ```ignore
//! let cache = CacheManager::new(CacheConfig::default())?;
//! cache.start()?;
//!
//! let key = CacheKey::new("stats", "dashboard");
//! cache.set_json(&key, &counts, SetOptions::with_ttl(Duration::from_secs(5)))?;
//! let counts: Option<Counts> = cache.get_json(&key);
//!
//! cache.invalidate(
//!     &[key],
//!     InvalidateOptions::cascading().preserve(CacheKey::new("dashboard", "comprehensive")),
//! );
//! cache.shutdown().await;
//! ```

pub mod clock;
pub mod config;
pub mod consistency;
pub mod error;
pub mod events;
pub mod invalidation;
pub mod manager;
pub mod optimizer;
pub mod refresh;
pub mod stats;
pub mod store;
pub mod ttl;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::CacheConfig;
pub use consistency::{
    ConsistencyChannel, ConsistencyEvent, ConsistencyReport, InMemoryHub, KeyState, MutationOp,
};
pub use error::{CacheError, CacheResult};
pub use events::{CacheEvent, SubscriptionId};
pub use invalidation::{
    DeleteOptions, InvalidateOptions, InvalidationMode, InvalidationNotice, InvalidationOutcome,
    InvalidationRule, MatchType,
};
pub use manager::{CacheManager, CacheManagerBuilder};
pub use optimizer::OptimizationRun;
pub use refresh::{loader_fn, LoadContext, Loader, RefreshFailure};
pub use stats::{CacheHealthScore, CacheStatsSnapshot};
pub use store::{BackingStore, CacheKey, CacheLookup, MemoryBackingStore, Priority, SetOptions};
pub use ttl::{AdaptiveTtlEngine, SystemSignals, TtlContext};

/// Dashcache version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Dashcache crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
