use std::time::Duration;

use async_nats::jetstream::{self, kv};
use courier::{DistributedLock, LockOptions};

async fn test_store() -> kv::Store {
    let nats_url = std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());
    let client = async_nats::connect(&nats_url).await.unwrap();
    let js = jetstream::new(client);
    js.create_key_value(kv::Config {
        bucket: format!("lock-spec-{}", uuid::Uuid::new_v4().simple()),
        history: 1,
        ..Default::default()
    })
    .await
    .unwrap()
}

fn fast_options() -> LockOptions {
    LockOptions {
        lease: Duration::from_secs(2),
        renew_interval: Duration::from_millis(500),
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(60),
    }
}

#[tokio::test]
#[ignore] // Requires NATS to be running
async fn second_owner_waits_until_release() {
    let store = test_store().await;
    let lock = DistributedLock::with_options(store, fast_options());

    let handle = lock
        .try_acquire("jobs.sweeper", "owner-a", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("first acquire succeeds");
    assert!(handle.is_held());

    // B cannot get in while A holds the lease.
    let contender = lock
        .try_acquire("jobs.sweeper", "owner-b", Duration::from_millis(1500))
        .await
        .unwrap();
    assert!(contender.is_none());

    handle.release().await;

    let contender = lock
        .try_acquire("jobs.sweeper", "owner-b", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(contender.is_some());
}

#[tokio::test]
#[ignore] // Requires NATS to be running
async fn independent_keys_do_not_contend() {
    let store = test_store().await;
    let lock = DistributedLock::with_options(store, fast_options());

    let first = lock
        .try_acquire("k1", "owner-a", Duration::from_secs(2))
        .await
        .unwrap();
    let second = lock
        .try_acquire("k2", "owner-c", Duration::from_secs(2))
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_some(), "a different key acquires immediately");
}

#[tokio::test]
#[ignore] // Requires NATS to be running
async fn expired_lease_is_stolen() {
    let store = test_store().await;
    // A renews far too slowly for its short lease, simulating a crash.
    let slow = DistributedLock::with_options(
        store.clone(),
        LockOptions {
            lease: Duration::from_millis(300),
            renew_interval: Duration::from_secs(60),
            ..fast_options()
        },
    );
    let fast = DistributedLock::with_options(store, fast_options());

    let stale = slow
        .try_acquire("jobs.rollup", "owner-a", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("initial acquire succeeds");

    tokio::time::sleep(Duration::from_millis(400)).await;

    let thief = fast
        .try_acquire("jobs.rollup", "owner-b", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(thief.is_some(), "expired lease must be stealable");

    // A's next renewal notices the moved revision.
    drop(stale);
}

#[tokio::test]
#[ignore] // Requires NATS to be running
async fn acquire_release_acquire_round_trips_for_the_same_owner() {
    let store = test_store().await;
    let lock = DistributedLock::with_options(store, fast_options());

    let first = lock
        .try_acquire("jobs.report", "owner-a", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("first acquire");
    first.release().await;

    let second = lock
        .try_acquire("jobs.report", "owner-a", Duration::from_secs(2))
        .await
        .unwrap();
    assert!(second.is_some(), "same owner reacquires after release");
}

#[tokio::test]
#[ignore] // Requires NATS to be running
async fn renewal_keeps_ownership_past_the_original_lease() {
    let store = test_store().await;
    let lock = DistributedLock::with_options(
        store,
        LockOptions {
            lease: Duration::from_millis(600),
            renew_interval: Duration::from_millis(200),
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(60),
        },
    );

    let handle = lock
        .try_acquire("jobs.renewed", "owner-a", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("acquire");

    // Outlive the original lease; renewals must have extended it.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(handle.is_held());

    let contender = lock
        .try_acquire("jobs.renewed", "owner-b", Duration::from_millis(300))
        .await
        .unwrap();
    assert!(contender.is_none(), "renewed lease must not be stealable");
}
