//! Cache manager integration tests
//!
//! Exercises the public `CacheManager` surface end to end: expiry and
//! stale serving, selective invalidation with repopulation, eviction,
//! compression, refresh races and the memory optimizer.

#[path = "testutils/mod.rs"]
mod testutils;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashcache::store::EntrySource;
use dashcache::{
    CacheConfig, CacheError, CacheEvent, CacheManager, InvalidateOptions, LoadContext, Priority,
    RefreshFailure, SetOptions,
};
use serde_json::json;
use testutils::{eventually, key, within, CacheFixture, CountingLoader, FailingLoader, GatedLoader};

#[test]
fn test_entry_expires_without_stale_serving() {
    let mut config = CacheConfig::for_testing();
    config.serve_stale = false;
    let fixture = CacheFixture::with_config(config);
    let cache = &fixture.cache;
    let stats = key("stats", "dashboard");

    cache
        .set_json(&stats, &json!({"count": 10}), SetOptions::with_ttl(Duration::from_millis(5000)))
        .unwrap();

    let value: serde_json::Value = cache.get_json(&stats).unwrap();
    assert_eq!(value, json!({"count": 10}));

    fixture.advance(Duration::from_millis(6000));
    let lookup = cache.get(&stats);
    assert!(!lookup.hit);
    assert!(lookup.value.is_none());
    assert!(!cache.contains(&stats));

    let snapshot = cache.get_stats();
    assert_eq!(snapshot.hits, 1);
    assert_eq!(snapshot.misses, 1);
    assert_eq!(snapshot.expirations, 1);
}

#[test]
fn test_expired_entry_served_stale_within_grace() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let feed = key("feed", "latest");

    cache
        .set(&feed, b"v1".to_vec(), SetOptions::with_ttl(Duration::from_secs(1)))
        .unwrap();
    fixture.advance(Duration::from_secs(2));

    let lookup = cache.get(&feed);
    assert!(lookup.hit);
    assert!(lookup.stale);
    assert_eq!(lookup.value.as_deref(), Some(&b"v1"[..]));

    // Past ttl + grace the entry is gone
    fixture.advance(cache.config().stale_grace);
    let lookup = cache.get(&feed);
    assert!(!lookup.hit);
    assert!(lookup.purged.is_some());
    assert_eq!(cache.get_stats().stale_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn test_preserved_key_survives_and_others_repopulate() {
    let fixture = CacheFixture::started();
    let cache = &fixture.cache;
    let loader = CountingLoader::new("fresh");
    cache.register_loader("dashboard", loader.clone(), LoadContext::default());

    let critical = key("dashboard", "critical-dashboard-data");
    let stats = key("dashboard", "stats");
    let comprehensive = key("dashboard", "comprehensive-dashboard-data");
    for k in [&critical, &stats, &comprehensive] {
        cache.set(k, b"original".to_vec(), SetOptions::default()).unwrap();
    }
    let before = cache.peek(&comprehensive).unwrap();

    let outcome = cache.invalidate(
        &[critical.clone(), stats.clone(), comprehensive.clone()],
        InvalidateOptions::default().preserve(comprehensive.clone()),
    );
    assert_eq!(outcome.removed.len(), 2);
    assert!(outcome.removed.contains(&critical));
    assert!(outcome.removed.contains(&stats));
    assert!(outcome.preserved.contains(&comprehensive));
    assert_eq!(outcome.refetch_scheduled, 2);

    // Byte-identical, metadata included
    assert_eq!(cache.peek(&comprehensive).unwrap(), before);

    let repopulated = eventually(Duration::from_secs(2), || {
        cache.contains(&critical) && cache.contains(&stats)
    })
    .await;
    assert!(repopulated, "invalidated keys were not repopulated within 2s");
    assert_eq!(cache.get(&critical).value.as_deref(), Some(&b"fresh"[..]));
    assert_eq!(cache.get(&stats).value.as_deref(), Some(&b"fresh"[..]));
    assert_eq!(cache.get(&comprehensive).value.as_deref(), Some(&b"original"[..]));
    assert_eq!(loader.calls(), 2);

    cache.shutdown().await;
}

#[test]
fn test_eviction_removes_only_least_recently_used() {
    let mut config = CacheConfig::for_testing();
    config.max_entries = 3;
    let fixture = CacheFixture::with_config(config);
    let cache = &fixture.cache;

    for name in ["a", "b", "c"] {
        cache.set(&key("users", name), name.as_bytes().to_vec(), SetOptions::default()).unwrap();
    }
    assert!(cache.get(&key("users", "a")).hit);

    let report = cache
        .set(&key("users", "d"), b"d".to_vec(), SetOptions::default())
        .unwrap();
    assert_eq!(report.evicted, vec![key("users", "b")]);
    assert!(cache.contains(&key("users", "a")));
    assert!(cache.contains(&key("users", "c")));
    assert!(cache.contains(&key("users", "d")));
    assert_eq!(cache.get_stats().evictions, 1);
}

#[test]
fn test_pinned_entries_are_never_evicted() {
    let mut config = CacheConfig::for_testing();
    config.max_entries = 2;
    let fixture = CacheFixture::with_config(config);
    let cache = &fixture.cache;
    let pinned = SetOptions::default().priority(Priority::Critical);

    cache.set(&key("reference", "a"), b"a".to_vec(), pinned.clone()).unwrap();
    cache.set(&key("reference", "b"), b"b".to_vec(), pinned).unwrap();

    let err = cache
        .set(&key("reference", "c"), b"c".to_vec(), SetOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::InsufficientCapacity { .. }));
    assert!(cache.contains(&key("reference", "a")));
    assert!(cache.contains(&key("reference", "b")));
    assert!(!cache.contains(&key("reference", "c")));
}

#[test]
fn test_large_values_are_compressed_transparently() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let report_key = key("reports", "monthly");
    let payload = "revenue,orders,visits\n".repeat(1_000).into_bytes();

    let report = cache.set(&report_key, payload.clone(), SetOptions::default()).unwrap();
    assert!(report.compressed);
    assert!(report.size_bytes < report.original_size);
    assert_eq!(report.original_size, payload.len());

    let lookup = cache.get(&report_key);
    assert_eq!(lookup.value.as_deref(), Some(payload.as_slice()));
    assert!(cache.get_stats().memory_usage < payload.len());
}

#[test]
fn test_oversized_value_is_rejected_and_cache_unchanged() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let blob = key("blobs", "huge");
    let limit = cache.config().max_entry_bytes;

    cache.set(&blob, b"small".to_vec(), SetOptions::default()).unwrap();
    let err = cache
        .set(&blob, vec![0u8; limit + 1], SetOptions::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::EntryTooLarge { .. }));
    assert_eq!(cache.get(&blob).value.as_deref(), Some(&b"small"[..]));
    assert_eq!(cache.get_stats().rejected_writes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_set_beats_late_refresh() {
    let fixture = CacheFixture::started();
    let cache = &fixture.cache;
    let loader = GatedLoader::new("from-loader");
    cache.register_loader("stats", loader.clone(), LoadContext::default());

    let counts = key("stats", "counts");
    cache.set(&counts, b"v0".to_vec(), SetOptions::default()).unwrap();
    assert!(cache.force_refresh(&counts).unwrap());

    within(Duration::from_secs(1), loader.wait_started()).await;
    cache.set(&counts, b"explicit".to_vec(), SetOptions::default()).unwrap();
    loader.release();

    let settled = eventually(Duration::from_secs(1), || {
        cache.get_stats().refresh.discarded == 1
    })
    .await;
    assert!(settled);
    assert_eq!(cache.get(&counts).value.as_deref(), Some(&b"explicit"[..]));
    assert_eq!(cache.peek(&counts).unwrap().metadata.source, EntrySource::Explicit);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stale_hit_triggers_background_refresh() {
    let fixture = CacheFixture::started();
    let cache = &fixture.cache;
    let loader = CountingLoader::new("v2");
    cache.register_loader("stats", loader.clone(), LoadContext::data_type("stats"));

    let visits = key("stats", "visits");
    cache
        .set(&visits, b"v1".to_vec(), SetOptions::with_ttl(Duration::from_secs(1)))
        .unwrap();
    fixture.advance(Duration::from_secs(2));

    let lookup = cache.get(&visits);
    assert!(lookup.stale);
    assert_eq!(lookup.value.as_deref(), Some(&b"v1"[..]));

    let refreshed = eventually(Duration::from_secs(1), || {
        cache
            .peek(&visits)
            .map(|entry| entry.metadata.source == EntrySource::Refresh)
            .unwrap_or(false)
    })
    .await;
    assert!(refreshed);

    let lookup = cache.get(&visits);
    assert!(!lookup.stale);
    assert_eq!(lookup.value.as_deref(), Some(&b"v2"[..]));
    assert_eq!(loader.calls(), 1);

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hit_near_expiry_schedules_refresh_ahead() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    cache.register_loader("stats", CountingLoader::new("next"), LoadContext::default());

    let daily = key("stats", "daily");
    cache
        .set(&daily, b"today".to_vec(), SetOptions::with_ttl(Duration::from_secs(100)))
        .unwrap();

    fixture.advance(Duration::from_secs(50));
    cache.get(&daily);
    assert_eq!(cache.get_stats().refresh.scheduled, 0);

    fixture.advance(Duration::from_secs(45));
    let lookup = cache.get(&daily);
    assert!(lookup.hit && !lookup.stale);
    assert_eq!(cache.get_stats().refresh.scheduled, 1);
    assert!(matches!(
        cache.recent_events(1).first(),
        Some(CacheEvent::RefreshScheduled { reason, .. }) if reason == "refresh-ahead"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_refresh_failure_keeps_stale_value_and_reports() {
    let fixture = CacheFixture::started();
    let cache = &fixture.cache;
    let loader = FailingLoader::always();
    cache.register_loader("feed", loader.clone(), LoadContext::default());

    let failures: Arc<Mutex<Vec<RefreshFailure>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = failures.clone();
    cache.on_refresh_failure(move |failure| sink.lock().unwrap().push(failure.clone()));

    let news = key("feed", "news");
    cache
        .set(&news, b"yesterday".to_vec(), SetOptions::with_ttl(Duration::from_secs(1)))
        .unwrap();
    fixture.advance(Duration::from_secs(2));
    assert!(cache.get(&news).stale);

    let failed = eventually(Duration::from_secs(2), || !failures.lock().unwrap().is_empty()).await;
    assert!(failed);
    {
        let failures = failures.lock().unwrap();
        assert_eq!(failures[0].key, news);
        assert_eq!(failures[0].attempts, cache.config().refresh.max_attempts);
    }
    assert_eq!(loader.calls(), cache.config().refresh.max_attempts);

    cache.suspend_refresh();
    let lookup = cache.get(&news);
    assert!(lookup.stale);
    assert_eq!(lookup.value.as_deref(), Some(&b"yesterday"[..]));
    assert!(lookup.error.is_some());

    cache.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_refresh_retries_then_succeeds() {
    let fixture = CacheFixture::started();
    let cache = &fixture.cache;
    let loader = FailingLoader::failing(2, "recovered");
    cache.register_loader("stats", loader.clone(), LoadContext::default());

    let totals = key("stats", "totals");
    cache.set(&totals, b"old".to_vec(), SetOptions::default()).unwrap();
    cache.force_refresh(&totals).unwrap();

    let recovered = eventually(Duration::from_secs(2), || {
        cache.get_stats().refresh.succeeded == 1
    })
    .await;
    assert!(recovered);
    assert_eq!(loader.calls(), 3);
    assert_eq!(cache.get_stats().refresh.retried, 2);
    assert_eq!(cache.get(&totals).value.as_deref(), Some(&b"recovered"[..]));

    cache.shutdown().await;
}

#[test]
fn test_memory_optimizer_relieves_pressure() {
    let mut config = CacheConfig::for_testing();
    config.compression.enabled = false;
    config.max_memory_bytes = 10_000;
    config.max_entry_bytes = 2_000;
    let fixture = CacheFixture::with_config(config);
    let cache = &fixture.cache;

    for i in 0..9 {
        cache
            .set(&key("stats", &format!("chunk-{}", i)), vec![7u8; 1_000], SetOptions::default())
            .unwrap();
    }
    cache
        .set(&key("stats", "tail"), vec![7u8; 500], SetOptions::default())
        .unwrap();
    assert!((cache.get_stats().memory_utilization() - 0.95).abs() < 1e-9);

    let run = cache.run_memory_optimizer();
    assert!(run.entries_evicted > 0);
    assert!(run.pressure_after < 0.8);
    assert!(run.compression_escalated);
    assert_eq!(cache.optimization_history(1), vec![run.clone()]);

    let evictions = cache
        .recent_events(50)
        .into_iter()
        .filter(|event| matches!(event, CacheEvent::Eviction { .. }))
        .count();
    assert_eq!(evictions, 1);
    assert!(cache.get_stats().memory_utilization() < 0.8);
}

#[test]
fn test_delete_cascades_unless_dependents_preserved() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let users = key("users", "all");
    let summary = key("dashboard", "summary");
    let chart = key("dashboard", "chart");

    cache.set(&users, b"[]".to_vec(), SetOptions::default()).unwrap();
    cache
        .set(&summary, b"{}".to_vec(), SetOptions::default().depends_on(users.clone()))
        .unwrap();
    cache
        .set(&chart, b"{}".to_vec(), SetOptions::default().depends_on(summary.clone()))
        .unwrap();

    let outcome = cache.delete(&users, dashcache::DeleteOptions::default());
    assert_eq!(outcome.removed.len(), 3);
    assert_eq!(outcome.cascaded, 2);
    assert!(!cache.contains(&chart));

    cache.set(&users, b"[]".to_vec(), SetOptions::default()).unwrap();
    cache
        .set(&summary, b"{}".to_vec(), SetOptions::default().depends_on(users.clone()))
        .unwrap();
    let outcome = cache.delete(&users, dashcache::DeleteOptions::preserving_dependents());
    assert_eq!(outcome.removed.len(), 1);
    assert!(cache.contains(&summary));
}

#[tokio::test(start_paused = true)]
async fn test_get_or_load_uses_loader_once() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let loader = CountingLoader::new(r#"{"active": 3}"#);
    let active = key("users", "active");

    for _ in 0..3 {
        let value = cache
            .get_or_load(&active, loader.clone(), SetOptions::default().data_type("users"))
            .await
            .unwrap();
        assert_eq!(&*value, br#"{"active": 3}"#);
    }
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.peek(&active).unwrap().ttl(), cache.compute_ttl("users"));
}

#[test]
fn test_independent_managers_do_not_share_entries() {
    let first = CacheManager::new(CacheConfig::for_testing()).unwrap();
    let second = CacheManager::new(CacheConfig::for_testing()).unwrap();
    first.set(&key("stats", "a"), b"1".to_vec(), SetOptions::default()).unwrap();
    assert!(!second.contains(&key("stats", "a")));
    assert_ne!(first.origin(), second.origin());
}

#[test]
fn test_health_score_reflects_usage() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let hot = key("stats", "hot");
    cache.set(&hot, b"1".to_vec(), SetOptions::default()).unwrap();
    for _ in 0..9 {
        cache.get(&hot);
    }
    cache.get(&key("stats", "cold"));

    let health = cache.health_score();
    assert!((health.hit_rate - 0.9).abs() < 1e-9);
    assert!(health.overall > 0.9);
    assert!(health.recommendations.is_empty());
}

#[test]
fn test_clear_drops_entries_and_graph() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    cache.set(&key("users", "a"), b"1".to_vec(), SetOptions::default()).unwrap();
    cache
        .set(
            &key("users", "b"),
            b"2".to_vec(),
            SetOptions::default().depends_on(key("users", "a")),
        )
        .unwrap();

    assert_eq!(cache.clear(), 2);
    assert!(cache.dependents_of(&key("users", "a")).is_empty());
    assert_eq!(cache.get_stats().entry_count, 0);
    assert!(cache.recent_events(10).is_empty());
}
