//! Subscription set laws: membership is exactly "expiry in the future",
//! adds are idempotent upserts, and enumeration is order-insensitive.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::params;
use feedbridge::subscription::{LocalSubscriptionSet, SubscriptionSet};

#[tokio::test(start_paused = true)]
async fn membership_tracks_expiry_exactly() {
    let set = LocalSubscriptionSet::new();
    set.add(&params("short", 1), Duration::from_millis(50), "k1")
        .await
        .unwrap();
    set.add(&params("long", 2), Duration::from_millis(500), "k2")
        .await
        .unwrap();

    assert_eq!(set.get_all().await.unwrap().len(), 2);

    tokio::time::advance(Duration::from_millis(60)).await;
    let remaining = set.get_all().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get("base"), Some(&serde_json::json!("long")));

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(set.get_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn add_is_an_idempotent_upsert() {
    let set = LocalSubscriptionSet::new();
    for _ in 0..10 {
        set.add(&params("ETH", 1), Duration::from_secs(60), "k")
            .await
            .unwrap();
    }
    assert_eq!(set.get_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn enumeration_covers_every_live_entry_regardless_of_order() {
    let set = LocalSubscriptionSet::new();
    let bases = ["d", "a", "c", "b"];
    for (i, base) in bases.iter().enumerate() {
        set.add(&params(base, i as i64), Duration::from_secs(60), "k")
            .await
            .unwrap();
    }

    let listed: HashSet<String> = set
        .get_all()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.canonical())
        .collect();
    let expected: HashSet<String> = bases
        .iter()
        .enumerate()
        .map(|(i, base)| params(base, i as i64).canonical())
        .collect();
    assert_eq!(listed, expected);
}
