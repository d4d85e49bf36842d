// Integration tests for silent-mode requests: optimistic resolution,
// persisted retry records, and resume after a simulated restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{sleep, timeout};

use freshet::prelude::*;
use freshet::transport::mock::MockTransport;

const FIVE_MINUTES: Duration = Duration::from_millis(300_000);

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_silent_failure_resolves_optimistically_and_retries() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = MockTransport::new();
    transport.enqueue(Err(RequestError::Transport("down".to_string())));
    transport.respond_with(json!({"saved": true}));
    let engine = Engine::new(
        "silent-retry",
        transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );

    let submit = engine.post(
        "/todos",
        Some(json!({"title": "buy milk"})),
        MethodConfig::new().cache(CachePolicy::memory(FIVE_MINUTES)),
    );
    let record_key = format!("silent-retry:silent:{}", submit.fingerprint());

    let successes = Arc::new(AtomicUsize::new(0));
    let seen = successes.clone();
    let optimistic = Arc::new(std::sync::Mutex::new(Value::Null));
    let captured = optimistic.clone();

    let handle = use_request(
        &submit,
        RequestConfig::default()
            .silent()
            .initial_data(json!({"title": "buy milk", "pending": true})),
    );
    handle.on_success(move |value| {
        seen.fetch_add(1, Ordering::SeqCst);
        *captured.lock().expect("lock") = value.clone();
    });

    // The caller's success fires immediately with the optimistic value,
    // before the transport has answered anything.
    wait_until(|| successes.load(Ordering::SeqCst) == 1).await;
    assert_eq!(
        *optimistic.lock().expect("lock"),
        json!({"title": "buy milk", "pending": true})
    );
    assert!(!handle.loading());
    assert_eq!(handle.error(), None);

    // The first background attempt failed, so a record was persisted.
    wait_until(|| storage.get_item(&record_key).is_some()).await;
    assert_eq!(transport.call_count(), 1);

    // The backoff elapses (paused clock) and the retry succeeds: the record
    // is removed and the cache reflects the server response.
    wait_until(|| storage.get_item(&record_key).is_none()).await;
    assert_eq!(transport.call_count(), 2);
    assert_eq!(
        submit.send(false).await.expect("cached send"),
        json!({"saved": true})
    );
    assert_eq!(transport.call_count(), 2);

    engine.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_silent_success_needs_no_retry_record() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = MockTransport::new();
    transport.respond_with(json!({"ok": true}));
    let engine = Engine::new(
        "silent-ok",
        transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );

    let submit = engine.post("/todos", Some(json!({"title": "t"})), MethodConfig::new());
    let _handle = use_request(&submit, RequestConfig::default().silent());

    wait_until(|| transport.call_count() == 1).await;
    sleep(Duration::from_millis(100)).await;
    assert!(storage.get_item(&format!("silent-ok:silent:{}", submit.fingerprint())).is_none());

    engine.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_persisted_record_resumes_on_a_later_run() {
    let storage = Arc::new(MemoryStorage::new());

    // First process run: the silent request keeps failing.
    let failing = MockTransport::new();
    failing.enqueue(Err(RequestError::Transport("down".to_string())));
    failing.enqueue(Err(RequestError::Transport("down".to_string())));
    let first = Engine::new(
        "silent-resume",
        failing.clone(),
        EngineOptions::new().storage(storage.clone()),
    );
    let submit = first.post("/todos", Some(json!({"title": "t"})), MethodConfig::new());
    let record_key = format!("silent-resume:silent:{}", submit.fingerprint());

    let _handle = use_request(&submit, RequestConfig::default().silent());
    wait_until(|| storage.get_item(&record_key).is_some()).await;
    // Simulated crash before any retry succeeds.
    first.dispose();

    // Second process run over the same storage: the record is re-driven and
    // succeeds, so it disappears.
    let recovering = MockTransport::new();
    recovering.respond_with(json!({"saved": true}));
    let second = Engine::new(
        "silent-resume",
        recovering.clone(),
        EngineOptions::new().storage(storage.clone()),
    );
    second.resume_silent_requests();

    wait_until(|| storage.get_item(&record_key).is_none()).await;
    assert!(recovering.call_count() >= 1);
    let body = recovering.calls()[0].body.clone();
    assert_eq!(body, Some(json!({"title": "t"})));

    second.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_clears_pending_records() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = MockTransport::new();
    transport.enqueue(Err(RequestError::Transport("down".to_string())));
    let engine = Engine::new(
        "silent-clear",
        transport.clone(),
        EngineOptions::new().storage(storage.clone()),
    );

    let submit = engine.post(
        "/todos",
        Some(json!({"v": 1})),
        MethodConfig::new().name("createTodo-clear"),
    );
    let record_key = format!("silent-clear:silent:{}", submit.fingerprint());
    let _handle = use_request(&submit, RequestConfig::default().silent());
    wait_until(|| storage.get_item(&record_key).is_some()).await;

    invalidate_cache(Some("createTodo-clear".into()));
    assert!(storage.get_item(&record_key).is_none());

    engine.dispose();
}
