//! Pool exhaustion tests
//!
//! Exercises lease/return behaviour under contention with in-memory clients,
//! so no ClickHouse server is required.

use ch_pool::{ClientPool, PoolError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Stand-in client that tracks how many holders use it at once
struct FakeClient {
    id: usize,
    in_use: AtomicUsize,
}

impl FakeClient {
    fn new(id: usize) -> Self {
        Self {
            id,
            in_use: AtomicUsize::new(0),
        }
    }
}

fn test_pool(size: usize, acquire_timeout: Duration) -> Arc<ClientPool<FakeClient>> {
    let clients = (0..size).map(FakeClient::new).collect();
    Arc::new(ClientPool::new("pool-test", clients, acquire_timeout).expect("non-empty pool"))
}

#[tokio::test]
async fn test_normal_acquisition_below_capacity() {
    let pool = test_pool(5, Duration::from_secs(1));

    let mut leases = Vec::new();
    for _ in 0..3 {
        leases.push(pool.acquire().await.expect("should lease below capacity"));
    }
    assert_eq!(pool.available(), 2);

    drop(leases);
    assert_eq!(pool.available(), 5);
}

#[tokio::test]
async fn test_rejection_at_capacity() {
    let pool = test_pool(3, Duration::from_millis(100));

    let mut leases = Vec::new();
    for _ in 0..3 {
        leases.push(pool.acquire().await.expect("should lease"));
    }

    let start = std::time::Instant::now();
    let result = pool.acquire().await;
    let elapsed = start.elapsed();

    match result {
        Err(PoolError::Timeout { pool, .. }) => assert_eq!(pool, "pool-test"),
        Err(other) => panic!("expected timeout, got {other}"),
        Ok(_) => panic!("lease should fail when exhausted"),
    }
    assert!(elapsed >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_client_never_shared_between_holders() {
    let pool = test_pool(4, Duration::from_secs(5));
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = Vec::new();

    for _ in 0..50 {
        let pool = Arc::clone(&pool);
        let seen = Arc::clone(&seen);
        handles.push(tokio::spawn(async move {
            let client = pool.acquire().await.expect("lease within timeout");
            let holders = client.in_use.fetch_add(1, Ordering::SeqCst);
            assert_eq!(holders, 0, "client {} leased twice", client.id);
            seen.lock().unwrap().insert(client.id);
            tokio::time::sleep(Duration::from_millis(2)).await;
            client.in_use.fetch_sub(1, Ordering::SeqCst);
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(pool.available(), 4);
    assert!(seen.lock().unwrap().len() <= 4);
}

#[tokio::test]
async fn test_pool_recovery_after_exhaustion() {
    let pool = test_pool(2, Duration::from_millis(500));

    let first = pool.acquire().await.expect("should lease");
    let _second = pool.acquire().await.expect("should lease");
    assert_eq!(pool.available(), 0);

    let released_id = first.id;
    drop(first);

    let again = pool.acquire().await.expect("should lease after release");
    assert_eq!(again.id, released_id);
}

#[tokio::test]
async fn test_waiter_wakes_when_client_returned() {
    let pool = test_pool(1, Duration::from_secs(2));
    let held = pool.acquire().await.expect("should lease");

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(held);

    let id = waiter.await.expect("join").expect("waiter should get the client");
    assert_eq!(id, 0);
}
