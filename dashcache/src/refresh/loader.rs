// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Loader collaborators and their registry

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::CacheResult;
use crate::store::CacheKey;

/// Produces the authoritative value for a key.
///
/// Loaders may be invoked repeatedly for the same key (retries, refreshes,
/// repairs) and must not leave partial side effects on failure.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, key: &CacheKey) -> CacheResult<Vec<u8>>;
}

/// Adapter turning an async closure into a [`Loader`]
pub struct FnLoader<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Loader for FnLoader<F, Fut>
where
    F: Fn(CacheKey) -> Fut + Send + Sync,
    Fut: Future<Output = CacheResult<Vec<u8>>> + Send + 'static,
{
    async fn load(&self, key: &CacheKey) -> CacheResult<Vec<u8>> {
        (self.f)(key.clone()).await
    }
}

pub fn loader_fn<F, Fut>(f: F) -> Arc<dyn Loader>
where
    F: Fn(CacheKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Vec<u8>>> + Send + 'static,
{
    Arc::new(FnLoader {
        f,
        _marker: PhantomData,
    })
}

/// How loaded values should be treated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadContext {
    /// Data type fed to the TTL engine; defaults to the namespace
    pub data_type: Option<String>,
}

impl LoadContext {
    pub fn data_type(data_type: impl Into<String>) -> Self {
        Self {
            data_type: Some(data_type.into()),
        }
    }

    pub(crate) fn data_type_for<'a>(&'a self, key: &'a CacheKey) -> &'a str {
        self.data_type.as_deref().unwrap_or(&key.namespace)
    }
}

#[derive(Clone)]
pub(crate) struct RegisteredLoader {
    pub loader: Arc<dyn Loader>,
    pub context: LoadContext,
}

/// Loaders by key, with per-namespace fallbacks
#[derive(Default)]
pub struct LoaderRegistry {
    by_key: RwLock<HashMap<CacheKey, RegisteredLoader>>,
    by_namespace: RwLock<HashMap<String, RegisteredLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_key(&self, key: CacheKey, loader: Arc<dyn Loader>, context: LoadContext) {
        self.by_key
            .write()
            .insert(key, RegisteredLoader { loader, context });
    }

    pub fn register_namespace(
        &self,
        namespace: impl Into<String>,
        loader: Arc<dyn Loader>,
        context: LoadContext,
    ) {
        self.by_namespace
            .write()
            .insert(namespace.into(), RegisteredLoader { loader, context });
    }

    pub fn forget_key(&self, key: &CacheKey) -> bool {
        self.by_key.write().remove(key).is_some()
    }

    /// Drop every per-key loader; namespace loaders stay
    pub fn clear_keys(&self) {
        self.by_key.write().clear();
    }

    pub fn key_loader_count(&self) -> usize {
        self.by_key.read().len()
    }

    pub fn has_loader(&self, key: &CacheKey) -> bool {
        self.by_key.read().contains_key(key) || self.by_namespace.read().contains_key(&key.namespace)
    }

    pub(crate) fn resolve(&self, key: &CacheKey) -> Option<RegisteredLoader> {
        if let Some(found) = self.by_key.read().get(key) {
            return Some(found.clone());
        }
        self.by_namespace.read().get(&key.namespace).cloned()
    }

    pub fn clear(&self) {
        self.by_key.write().clear();
        self.by_namespace.write().clear();
    }
}
