//! Cache laws: write atomicity per key, polling, key determinism, and the
//! response-cache round trip.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{Harness, params, test_settings};
use feedbridge::cache::{Cache, LocalCache, poll_for_entry};
use feedbridge::params::cache_key;
use feedbridge::response::{AdapterResponse, ResponseTimestamps, unix_ms_now};

#[tokio::test]
async fn concurrent_writers_never_interleave_within_one_value() {
    let cache = Arc::new(LocalCache::new(16));
    let a = json!({"statusCode": 200, "data": {"writer": "a"}, "result": "a"});
    let b = json!({"statusCode": 200, "data": {"writer": "b"}, "result": "b"});

    let mut tasks = Vec::new();
    for value in [a.clone(), b.clone()] {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                cache
                    .set("k", value.clone(), Duration::from_secs(60))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let read = cache.get("k").await.unwrap().unwrap();
    assert!(read == a || read == b, "value was mixed: {read}");
}

#[tokio::test(start_paused = true)]
async fn polling_observes_a_value_written_mid_poll() {
    let cache = Arc::new(LocalCache::new(16));
    let writer = cache.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(45)).await;
        writer
            .set("k", json!({"ready": true}), Duration::from_secs(60))
            .await
            .unwrap();
    });

    let polled = poll_for_entry(cache.as_ref(), "k", 10, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(polled, Some(json!({"ready": true})));
}

#[tokio::test(start_paused = true)]
async fn polling_gives_up_after_the_retry_budget() {
    let cache = LocalCache::new(16);
    let polled = poll_for_entry(&cache, "missing", 3, Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(polled, None);
}

#[test]
fn cache_keys_are_deterministic_across_param_order() {
    let a = params("qweqwe", 111);
    let mut b = feedbridge::params::RequestParams::new();
    b.insert("factor", json!(111));
    b.insert("base", json!("qweqwe"));

    assert_eq!(
        cache_key(None, "TEST", "test", "rest", &a),
        cache_key(None, "TEST", "test", "rest", &b)
    );
    assert_eq!(
        cache_key(None, "TEST", "test", "rest", &a),
        r#"TEST-test-rest-{"base":"qweqwe","factor":111}"#
    );
}

#[tokio::test]
async fn pre_populated_entry_is_served_until_it_expires() {
    let harness = Harness::new(test_settings());
    let request_params = params("qweqwe", 111);
    let key = harness.response_cache.key("test", "rest", &request_params);

    // Inject a live entry directly through the raw cache, the way another
    // replica would have.
    let injected = AdapterResponse::success(
        json!({"injected": true}),
        json!("injected"),
        ResponseTimestamps::synchronous(unix_ms_now()),
    );
    harness
        .cache
        .set(
            &key,
            serde_json::to_value(&injected).unwrap(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    let hit = harness.response_cache.read(&key).await.unwrap().unwrap();
    assert_eq!(hit.status_code(), 200);
    match hit {
        AdapterResponse::Success(s) => assert_eq!(s.result, json!("injected")),
        _ => panic!("expected success"),
    }
}

#[tokio::test(start_paused = true)]
async fn expired_entry_falls_through_to_a_miss() {
    let harness = Harness::new(test_settings());
    let request_params = params("qweqwe", 111);
    let key = harness.response_cache.key("test", "rest", &request_params);

    let injected = AdapterResponse::success(
        json!({}),
        json!("stale"),
        ResponseTimestamps::synchronous(unix_ms_now()),
    );
    harness
        .cache
        .set(
            &key,
            serde_json::to_value(&injected).unwrap(),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(5)).await;

    assert!(harness.response_cache.read(&key).await.unwrap().is_none());
}
