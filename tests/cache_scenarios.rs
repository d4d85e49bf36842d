// Integration tests for cache reuse, invalidation and cross-site updates.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, timeout};

use freshet::prelude::*;
use freshet::transport::mock::MockTransport;

const FIVE_MINUTES: Duration = Duration::from_millis(300_000);

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_repeated_get_within_expiry_skips_transport() {
    let transport = MockTransport::new();
    transport.respond_with(json!({"id": 1}));
    let engine = Engine::new("cache-reuse", transport.clone(), EngineOptions::new());

    let config = || {
        MethodConfig::new()
            .name("user1-reuse")
            .cache(CachePolicy::memory(FIVE_MINUTES))
    };

    let user = engine.get("/users/1", config());
    assert_eq!(user.send(false).await.expect("first send"), json!({"id": 1}));
    assert_eq!(transport.call_count(), 1);

    // An independently constructed descriptor for the same resource collides
    // in the cache.
    let again = engine.get("/users/1", config());
    assert_eq!(again.send(false).await.expect("second send"), json!({"id": 1}));
    assert_eq!(transport.call_count(), 1);

    engine.dispose();
}

#[tokio::test]
async fn test_invalidation_between_sends_reissues_request() {
    let transport = MockTransport::new();
    transport.respond_with(json!({"id": 1}));
    let engine = Engine::new("cache-invalidate", transport.clone(), EngineOptions::new());

    let user = engine.get(
        "/users/1",
        MethodConfig::new()
            .name("user1-invalidate")
            .cache(CachePolicy::memory(FIVE_MINUTES)),
    );
    user.send(false).await.expect("first send");
    assert_eq!(transport.call_count(), 1);

    invalidate_cache(Some("user1-invalidate".into()));

    user.send(false).await.expect("second send");
    assert_eq!(transport.call_count(), 2);

    engine.dispose();
}

#[tokio::test]
async fn test_unmatched_selectors_are_silent_noops() {
    invalidate_cache(Some("nobody-has-this-name".into()));
    update_state("nobody-has-this-name", |value| value);
    set_cache_data("nobody-has-this-name", json!(1));
}

#[tokio::test]
async fn test_set_cache_data_updates_without_network() {
    let transport = MockTransport::new();
    transport.respond_with(json!({"id": 1, "name": "A"}));
    let engine = Engine::new("cache-set", transport.clone(), EngineOptions::new());

    let user = engine.get(
        "/users/1",
        MethodConfig::new()
            .name("user1-set")
            .cache(CachePolicy::memory(FIVE_MINUTES)),
    );
    user.send(false).await.expect("first send");
    assert_eq!(transport.call_count(), 1);

    set_cache_data(
        "user1-set",
        CacheUpdate::compute(|mut old| {
            old["name"] = json!("X");
            old
        }),
    );

    let updated = user.send(false).await.expect("cached send");
    assert_eq!(updated, json!({"id": 1, "name": "X"}));
    assert_eq!(transport.call_count(), 1);

    engine.dispose();
}

#[tokio::test]
async fn test_disabled_policy_always_hits_transport() {
    let transport = MockTransport::new();
    let engine = Engine::new("cache-disabled", transport.clone(), EngineOptions::new());

    // POST does not cache by default.
    let submit = engine.post("/submit", Some(json!({"v": 1})), MethodConfig::new());
    submit.send(false).await.expect("first send");
    submit.send(false).await.expect("second send");
    assert_eq!(transport.call_count(), 2);

    // set_cache_data under a disabled policy stays uncached.
    let named = engine.post(
        "/submit",
        Some(json!({"v": 1})),
        MethodConfig::new().name("submit-disabled"),
    );
    set_cache_data("submit-disabled", json!("never stored"));
    named.send(false).await.expect("third send");
    assert_eq!(transport.call_count(), 3);

    engine.dispose();
}

#[tokio::test]
async fn test_matcher_spans_engines_unless_scoped() {
    let transport_a = MockTransport::new();
    let transport_b = MockTransport::new();
    let engine_a = Engine::new("match-a", transport_a.clone(), EngineOptions::new());
    let engine_b = Engine::new("match-b", transport_b.clone(), EngineOptions::new());

    let config = || {
        MethodConfig::new()
            .name("userList-match")
            .cache(CachePolicy::memory(FIVE_MINUTES))
    };
    let list_a = engine_a.get("/users", config());
    let list_b = engine_b.get("/users", config());
    list_a.send(false).await.expect("send a");
    list_b.send(false).await.expect("send b");
    assert_eq!((transport_a.call_count(), transport_b.call_count()), (1, 1));

    // Scoped invalidation only touches engine A's entry.
    invalidate_cache(Some(
        MethodFilter::named("userList-match").scope("match-a").into(),
    ));
    list_a.send(false).await.expect("send a again");
    list_b.send(false).await.expect("send b again");
    assert_eq!((transport_a.call_count(), transport_b.call_count()), (2, 1));

    // Unscoped invalidation reaches both engines.
    invalidate_cache(Some("userList-match".into()));
    list_a.send(false).await.expect("send a third");
    list_b.send(false).await.expect("send b third");
    assert_eq!((transport_a.call_count(), transport_b.call_count()), (3, 2));

    engine_a.dispose();
    engine_b.dispose();
}

#[tokio::test]
async fn test_placeholder_serves_persisted_value_and_refreshes_once() {
    let storage = Arc::new(MemoryStorage::new());
    let policy = CachePolicy::placeholder(Duration::from_secs(60));

    // First process run populates both tiers.
    let warm_transport = MockTransport::new();
    warm_transport.respond_with(json!("stale"));
    let warm = Engine::new(
        "placeholder",
        warm_transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );
    warm.get("/feed", MethodConfig::new().cache(policy.clone()))
        .send(false)
        .await
        .expect("warm send");
    warm.dispose();

    // Cold start: only the persisted tier holds the value.
    let cold_transport = MockTransport::new();
    cold_transport.respond_with(json!("fresh"));
    let cold = Engine::new(
        "placeholder",
        cold_transport.clone(),
        EngineOptions::new().storage(storage),
    );
    let feed = cold.get("/feed", MethodConfig::new().cache(policy));

    // The placeholder satisfies the immediate need...
    assert_eq!(feed.send(false).await.expect("cold send"), json!("stale"));
    // ...while exactly one background execution refreshes the entry.
    wait_until(|| cold_transport.call_count() == 1).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(feed.send(false).await.expect("refreshed send"), json!("fresh"));
    assert_eq!(cold_transport.call_count(), 1);

    cold.dispose();
}

#[tokio::test]
async fn test_restore_promotes_and_tag_mismatch_refetches() {
    let storage = Arc::new(MemoryStorage::new());

    let warm_transport = MockTransport::new();
    warm_transport.respond_with(json!("v1 data"));
    let warm = Engine::new(
        "restore",
        warm_transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );
    let v1 = CachePolicy::restore(Duration::from_secs(60)).tag("v1");
    warm.get("/config", MethodConfig::new().cache(v1.clone()))
        .send(false)
        .await
        .expect("warm send");
    warm.dispose();

    // Same tag on a cold start: restored without a network call.
    let cold_transport = MockTransport::new();
    cold_transport.respond_with(json!("v2 data"));
    let cold = Engine::new(
        "restore",
        cold_transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );
    let same = cold.get("/config", MethodConfig::new().cache(v1));
    assert_eq!(same.send(false).await.expect("restored"), json!("v1 data"));
    assert_eq!(cold_transport.call_count(), 0);
    cold.dispose();

    // A bumped tag treats the persisted entry as absent.
    let bumped_transport = MockTransport::new();
    bumped_transport.respond_with(json!("v2 data"));
    let bumped = Engine::new(
        "restore",
        bumped_transport.clone(),
        EngineOptions::new().storage(storage),
    );
    let v2 = CachePolicy::restore(Duration::from_secs(60)).tag("v2");
    let method = bumped.get("/config", MethodConfig::new().cache(v2));
    assert_eq!(method.send(false).await.expect("refetched"), json!("v2 data"));
    assert_eq!(bumped_transport.call_count(), 1);
    bumped.dispose();
}

#[tokio::test]
async fn test_update_state_reaches_active_sites_and_cache() {
    let transport = MockTransport::new();
    transport.respond_with(json!({"id": 1, "name": "A"}));
    let engine = Engine::new("update-state", transport.clone(), EngineOptions::new());

    let user = engine.get(
        "/users/1",
        MethodConfig::new()
            .name("user1-update")
            .cache(CachePolicy::memory(FIVE_MINUTES)),
    );
    let handle = use_request(&user, RequestConfig::default());
    wait_until(|| handle.data() != serde_json::Value::Null).await;

    update_state("user1-update", |mut old| {
        old["name"] = json!("X");
        old
    });

    // The active site's state was rewritten...
    assert_eq!(handle.data(), json!({"id": 1, "name": "X"}));
    // ...and the cache agrees, without another network call.
    assert_eq!(
        user.send(false).await.expect("cached send"),
        json!({"id": 1, "name": "X"})
    );
    assert_eq!(transport.call_count(), 1);

    engine.dispose();
}
