// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Optional persistent layer behind the in-memory store

use std::collections::HashMap;

use parking_lot::RwLock;

use super::entry::CacheKey;
use crate::error::CacheResult;

/// Write-through / read-through persistence for cache values.
///
/// Implementations must be cheap to call from async code; the manager calls
/// them inline on `set`, `delete` and on a miss before consulting loaders.
pub trait BackingStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> CacheResult<Option<Vec<u8>>>;

    fn persist(&self, key: &CacheKey, value: &[u8]) -> CacheResult<()>;

    fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    fn name(&self) -> &str {
        "backing-store"
    }
}

/// In-memory backing store, mostly for tests and demos
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    values: RwLock<HashMap<CacheKey, Vec<u8>>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.values.read().contains_key(key)
    }
}

impl BackingStore for MemoryBackingStore {
    fn load(&self, key: &CacheKey) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn persist(&self, key: &CacheKey, value: &[u8]) -> CacheResult<()> {
        self.values.write().insert(key.clone(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.values.write().remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
