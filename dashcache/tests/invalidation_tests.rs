//! Invalidation tests: rules, dependency cascades and debouncing

#[path = "testutils/mod.rs"]
mod testutils;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashcache::invalidation::InvalidationTrigger;
use dashcache::{
    CacheError, CacheEvent, InvalidateOptions, InvalidationNotice, InvalidationRule, LoadContext,
    MatchType, SetOptions,
};
use testutils::{key, CacheFixture, CountingLoader};

fn seed(fixture: &CacheFixture, keys: &[dashcache::CacheKey]) {
    for k in keys {
        fixture
            .cache
            .set(k, b"cached".to_vec(), SetOptions::default())
            .unwrap();
    }
}

#[test]
fn test_rule_fires_on_matching_write() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let summary = key("dashboard", "summary");
    let revenue = key("stats", "revenue");
    let users = key("users", "all");
    seed(&fixture, &[summary.clone(), revenue.clone(), users.clone()]);

    cache
        .add_invalidation_rule(
            InvalidationRule::prefix("order-")
                .in_namespace("orders")
                .targets([summary.clone(), revenue.clone()]),
        )
        .unwrap();

    let notices: Arc<Mutex<Vec<InvalidationNotice>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = notices.clone();
    cache.on_invalidate(move |notice| sink.lock().unwrap().push(notice.clone()));

    // Other namespace: no match
    cache.set(&key("carts", "order-1"), b"{}".to_vec(), SetOptions::default()).unwrap();
    assert!(cache.contains(&summary));

    cache.set(&key("orders", "order-1"), b"{}".to_vec(), SetOptions::default()).unwrap();
    assert!(!cache.contains(&summary));
    assert!(!cache.contains(&revenue));
    assert!(cache.contains(&users));
    assert!(cache.contains(&key("orders", "order-1")));

    let notices = notices.lock().unwrap();
    let fired: Vec<&InvalidationNotice> =
        notices.iter().filter(|notice| !notice.removed.is_empty()).collect();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].removed.len(), 2);
    assert_eq!(
        fired[0].trigger,
        InvalidationTrigger::Rule {
            event_key: key("orders", "order-1")
        }
    );
}

#[test]
fn test_rule_without_targets_invalidates_event_key() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let session = key("sessions", "abc");
    cache
        .add_invalidation_rule(InvalidationRule::regex(r"^[a-z]{3}$").in_namespace("sessions"))
        .unwrap();

    // A write never invalidates itself
    cache.set(&session, b"1".to_vec(), SetOptions::default()).unwrap();
    assert!(cache.contains(&session));

    let outcome = cache.trigger_invalidation(&session);
    assert!(outcome.removed.contains(&session));
    assert!(!cache.contains(&session));
}

#[test]
fn test_invalid_and_removed_rules() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;

    let err = cache
        .add_invalidation_rule(InvalidationRule::new("(unclosed", MatchType::Regex))
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidPattern(_)));
    assert!(cache.add_invalidation_rule(InvalidationRule::exact("")).is_err());

    let target = key("stats", "daily");
    seed(&fixture, &[target.clone()]);
    let id = cache
        .add_invalidation_rule(InvalidationRule::exact("tick").target(target.clone()))
        .unwrap();
    assert!(cache.remove_invalidation_rule(id).is_some());
    assert!(cache.remove_invalidation_rule(id).is_none());

    cache.trigger_invalidation(&key("events", "tick"));
    assert!(cache.contains(&target));
}

#[test]
fn test_cascade_stops_at_preserved_keys() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let base = key("users", "all");
    let mid = key("dashboard", "summary");
    let leaf = key("dashboard", "summary-chart");
    let sibling = key("dashboard", "user-table");

    seed(&fixture, &[base.clone(), mid.clone(), leaf.clone(), sibling.clone()]);
    cache.add_dependency(&mid, [base.clone()]).unwrap();
    cache.add_dependency(&leaf, [mid.clone()]).unwrap();
    cache.add_dependency(&sibling, [base.clone()]).unwrap();
    assert_eq!(cache.peek(&mid).unwrap().dependencies.len(), 1);

    let outcome = cache.invalidate(
        &[base.clone()],
        InvalidateOptions::cascading().preserve(mid.clone()),
    );
    assert_eq!(outcome.removed.len(), 2);
    assert!(outcome.removed.contains(&base));
    assert!(outcome.removed.contains(&sibling));
    assert_eq!(outcome.cascaded, 1);
    assert!(outcome.preserved.contains(&mid));
    assert!(cache.contains(&mid));
    assert!(cache.contains(&leaf));
}

#[test]
fn test_cascade_reaches_transitive_dependents() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let root = key("reference", "countries");
    let chain: Vec<_> = (0..4).map(|i| key("dashboard", &format!("level-{}", i))).collect();

    seed(&fixture, &[root.clone()]);
    let mut parent = root.clone();
    for k in &chain {
        cache
            .set(k, b"v".to_vec(), SetOptions::default().depends_on(parent.clone()))
            .unwrap();
        parent = k.clone();
    }

    let outcome = cache.invalidate(&[root.clone()], InvalidateOptions::cascading());
    assert_eq!(outcome.removed.len(), 5);
    assert_eq!(outcome.cascade_depth, 4);
    assert!(chain.iter().all(|k| !cache.contains(k)));

    let stats = cache.get_stats().invalidation;
    assert_eq!(stats.cascaded_keys, 4);
    assert_eq!(stats.dependency_edges, 0);
}

#[test]
fn test_non_cascading_invalidation_keeps_dependents() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let base = key("users", "all");
    let derived = key("dashboard", "users");
    seed(&fixture, &[base.clone()]);
    cache
        .set(&derived, b"d".to_vec(), SetOptions::default().depends_on(base.clone()))
        .unwrap();

    let outcome = cache.invalidate(&[base.clone()], InvalidateOptions::default());
    assert_eq!(outcome.removed.len(), 1);
    assert!(cache.contains(&derived));
    assert!(matches!(
        cache.recent_events(1).first(),
        Some(CacheEvent::Invalidation { removed: 1, .. })
    ));
}

#[test]
fn test_refetch_can_be_disabled() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    cache.register_loader("stats", CountingLoader::new("x"), LoadContext::default());
    let hourly = key("stats", "hourly");
    seed(&fixture, &[hourly.clone()]);

    let outcome = cache.invalidate(&[hourly.clone()], InvalidateOptions::default().refetch(false));
    assert_eq!(outcome.refetch_scheduled, 0);

    seed(&fixture, &[hourly.clone()]);
    let outcome = cache.invalidate(&[hourly], InvalidateOptions::default());
    assert_eq!(outcome.refetch_scheduled, 1);
    assert_eq!(cache.get_stats().refresh.queue_depth, 1);
}

#[tokio::test(start_paused = true)]
async fn test_debounced_rule_coalesces_bursts() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let engagement = key("stats", "engagement");
    seed(&fixture, &[engagement.clone()]);
    cache
        .add_invalidation_rule(
            InvalidationRule::prefix("click")
                .in_namespace("ui")
                .target(engagement.clone())
                .debounced(),
        )
        .unwrap();

    let click = key("ui", "click-button");
    for _ in 0..3 {
        let outcome = cache.trigger_invalidation(&click);
        assert!(outcome.removed.is_empty());
    }
    assert!(cache.contains(&engagement));
    assert_eq!(cache.get_stats().invalidation.pending_debounced, 1);

    let window = cache.config().invalidation.debounce_window;
    tokio::time::sleep(window + Duration::from_millis(10)).await;

    assert!(!cache.contains(&engagement));
    let stats = cache.get_stats().invalidation;
    assert_eq!(stats.debounced_events, 3);
    assert_eq!(stats.coalesced_events, 2);
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.pending_debounced, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_debounce_flushes_on_demand() {
    let fixture = CacheFixture::new();
    let cache = &fixture.cache;
    let engagement = key("stats", "engagement");
    seed(&fixture, &[engagement.clone()]);
    cache
        .add_invalidation_rule(
            InvalidationRule::exact("scroll")
                .target(engagement.clone())
                .debounced(),
        )
        .unwrap();

    cache.trigger_invalidation(&key("ui", "scroll"));
    let flushed = cache.flush_invalidations();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].removed.contains(&engagement));

    // The timer finds nothing left to flush
    tokio::time::sleep(cache.config().invalidation.debounce_window * 2).await;
    assert_eq!(cache.get_stats().invalidation.invalidations, 1);
}
