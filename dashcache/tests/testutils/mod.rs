//! Test utilities for Dashcache integration tests
//!
//! Fixture builders, scripted loaders and a lossy channel wrapper. Every
//! fixture is an isolated `CacheManager`, so tests can run in parallel.

#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashcache::consistency::{ChannelMessage, ChannelReceiver};
use dashcache::{
    CacheConfig, CacheError, CacheKey, CacheManager, CacheResult, ConsistencyChannel, InMemoryHub,
    Loader, ManualClock,
};
use tokio::sync::{Notify, Semaphore};

/// Wednesday 2025-03-12 10:00:00 UTC
pub const BUSINESS_HOURS_MILLIS: u64 = 1_741_773_600_000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Isolated manager with a manual clock
pub struct CacheFixture {
    pub cache: CacheManager,
    pub clock: Arc<ManualClock>,
}

impl CacheFixture {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::for_testing())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        init_logging();
        let clock = Arc::new(ManualClock::new(BUSINESS_HOURS_MILLIS));
        let cache = CacheManager::builder()
            .with_config(config)
            .with_clock(clock.clone())
            .build()
            .expect("valid test configuration");
        Self { cache, clock }
    }

    /// Manager started on the current runtime
    pub fn started() -> Self {
        let fixture = Self::new();
        fixture.cache.start().expect("tokio runtime");
        fixture
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// Two or more managers sharing one in-memory hub
pub struct PeerFixture {
    pub hub: InMemoryHub,
    pub peers: Vec<Peer>,
}

pub struct Peer {
    pub cache: CacheManager,
    pub clock: Arc<ManualClock>,
    pub channel: Arc<LossyChannel>,
}

impl PeerFixture {
    /// One started manager per start time, each with its own clock
    pub fn started(start_millis: &[u64]) -> Self {
        Self::started_with(CacheConfig::for_testing(), start_millis)
    }

    pub fn started_with(config: CacheConfig, start_millis: &[u64]) -> Self {
        init_logging();
        let hub = InMemoryHub::new(config.consistency.channel_capacity);
        let peers = start_millis
            .iter()
            .map(|start| {
                let clock = Arc::new(ManualClock::new(*start));
                let channel = Arc::new(LossyChannel::new(hub.channel()));
                let cache = CacheManager::builder()
                    .with_config(config.clone())
                    .with_clock(clock.clone())
                    .with_channel(channel.clone())
                    .build()
                    .expect("valid test configuration");
                cache.start().expect("tokio runtime");
                Peer {
                    cache,
                    clock,
                    channel,
                }
            })
            .collect();
        Self { hub, peers }
    }

    pub fn peer(&self, index: usize) -> &Peer {
        &self.peers[index]
    }
}

/// Channel wrapper that can drop outgoing mutation broadcasts, simulating
/// lost messages while digest traffic still flows
pub struct LossyChannel {
    inner: Arc<dyn ConsistencyChannel>,
    drop_mutations: AtomicBool,
    dropped: AtomicU32,
}

impl LossyChannel {
    pub fn new(inner: Arc<dyn ConsistencyChannel>) -> Self {
        Self {
            inner,
            drop_mutations: AtomicBool::new(false),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn drop_mutations(&self, drop: bool) {
        self.drop_mutations.store(drop, Ordering::SeqCst);
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl ConsistencyChannel for LossyChannel {
    fn send(&self, frame: Vec<u8>) -> CacheResult<()> {
        if self.drop_mutations.load(Ordering::SeqCst) {
            if let Ok(ChannelMessage::Mutation { .. }) = ChannelMessage::decode(&frame) {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
        }
        self.inner.send(frame)
    }

    fn subscribe(&self) -> Box<dyn ChannelReceiver> {
        self.inner.subscribe()
    }

    fn name(&self) -> &str {
        "lossy"
    }
}

/// Returns a settable value and counts invocations
pub struct CountingLoader {
    value: Mutex<Vec<u8>>,
    calls: AtomicU32,
}

impl CountingLoader {
    pub fn new(value: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_value(&self, value: impl Into<Vec<u8>>) {
        *self.value.lock().unwrap() = value.into();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for CountingLoader {
    async fn load(&self, _key: &CacheKey) -> CacheResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.lock().unwrap().clone())
    }
}

/// Fails a number of times, then succeeds
pub struct FailingLoader {
    failures_left: AtomicU32,
    value: Vec<u8>,
    calls: AtomicU32,
}

impl FailingLoader {
    pub fn failing(times: u32, then: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(times),
            value: then.into(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn always() -> Arc<Self> {
        Self::failing(u32::MAX, Vec::new())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for FailingLoader {
    async fn load(&self, key: &CacheKey) -> CacheResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(CacheError::loader(format!("{} unavailable", key)));
        }
        Ok(self.value.clone())
    }
}

/// Blocks every load until released
pub struct GatedLoader {
    value: Vec<u8>,
    started: Notify,
    release: Semaphore,
    calls: AtomicU32,
}

impl GatedLoader {
    pub fn new(value: impl Into<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            value: value.into(),
            started: Notify::new(),
            release: Semaphore::new(0),
            calls: AtomicU32::new(0),
        })
    }

    /// Wait until a load is in progress
    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.release.add_permits(1);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Loader for GatedLoader {
    async fn load(&self, _key: &CacheKey) -> CacheResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let permit = self
            .release
            .acquire()
            .await
            .map_err(|e| CacheError::loader(e.to_string()))?;
        permit.forget();
        Ok(self.value.clone())
    }
}

/// Poll `condition` on tokio time until it holds or `within` elapses
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        if condition() {
            return true;
        }
        if waited >= within {
            return false;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}

/// Await a future with a generous (virtual) deadline
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("timed out waiting on test future")
}

pub fn key(namespace: &str, name: &str) -> CacheKey {
    CacheKey::new(namespace, name)
}
