//! Tests for rivven-bridge pool module

mod common;

use common::{MockBackend, MockFactory};
use rivven_bridge::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn pool(backend: &Arc<MockBackend>, config: PoolConfig) -> Arc<ConnectionManager> {
    let provider = ProviderConfig::from_url(common::url(Provider::Postgres)).unwrap();
    Arc::new(
        ConnectionManager::new(provider, MockFactory::new(backend.clone()), config)
            .await
            .unwrap(),
    )
}

fn no_retry(max: u32) -> PoolConfig {
    PoolConfig::new(max).with_retry(RetryPolicy::none())
}

// ==================== Bounds ====================

#[tokio::test]
async fn test_in_use_never_exceeds_max() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(3)).await;
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let lease = pool.acquire(Duration::from_secs(5)).await.unwrap();
            peak.fetch_max(pool.stats().in_use, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(lease).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.acquisitions, 12);
    assert_eq!(stats.in_use, 0);
    assert!(stats.open_connections <= 3);
    assert!(backend.connects() <= 3);
}

#[tokio::test]
async fn test_waiter_proceeds_after_release() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(2)).await;

    let first = pool.acquire(Duration::from_secs(1)).await.unwrap();
    let _second = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    pool.release(first).await;
    let third = waiter.await.unwrap().unwrap();
    assert!(pool.checkout(&third).is_ok());
    assert_eq!(backend.connects(), 2);
}

#[tokio::test]
async fn test_acquire_timeout_is_bounded() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1)).await;
    let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();

    let start = Instant::now();
    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err.category(), ErrorCategory::PoolExhausted);
    assert!(err.is_retriable());
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(1000));
    assert_eq!(pool.stats().exhausted_count, 1);
}

// ==================== Connection lifecycle ====================

#[tokio::test]
async fn test_min_idle_opens_eagerly() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(4).with_min_idle(2)).await;

    assert_eq!(backend.connects(), 2);
    let stats = pool.stats();
    assert_eq!(stats.open_connections, 2);
    assert_eq!(stats.idle_connections, 2);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(2)).await;

    let lease = pool.acquire_default().await.unwrap();
    let slot = lease.slot();
    pool.release(lease).await;
    let lease = pool.acquire_default().await.unwrap();

    assert_eq!(lease.slot(), slot);
    assert_eq!(backend.connects(), 1);
}

#[tokio::test]
async fn test_invalidate_opens_replacement() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1)).await;

    let lease = pool.acquire_default().await.unwrap();
    let conn = pool.checkout(&lease).unwrap();
    pool.invalidate(lease).await;

    assert!(!conn.is_valid().await);
    assert_eq!(backend.connects(), 2);
    let stats = pool.stats();
    assert_eq!(stats.open_connections, 1);
    assert_eq!(stats.idle_connections, 1);
}

#[tokio::test]
async fn test_stale_lease_is_refused() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1)).await;
    let other = self::pool(&backend, no_retry(1)).await;

    let lease = pool.acquire_default().await.unwrap();
    let err = other.checkout(&lease).err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Protocol);
}

#[tokio::test]
async fn test_in_flight_release_discards_connection() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1)).await;

    let lease = pool.acquire_default().await.unwrap();
    let conn = pool.checkout(&lease).unwrap();
    lease.begin_statement();
    assert!(lease.is_in_flight());
    pool.release(lease).await;

    assert!(!conn.is_valid().await);
    assert_eq!(backend.connects(), 2);
}

#[tokio::test]
async fn test_dead_connection_is_not_returned_to_idle() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(2)).await;

    let lease = pool.acquire_default().await.unwrap();
    backend.set_healthy(false);
    pool.release(lease).await;

    let stats = pool.stats();
    assert_eq!(stats.health_check_failures, 1);
    assert_eq!(stats.open_connections, 0);
    assert_eq!(stats.idle_connections, 0);
}

#[tokio::test]
async fn test_idle_validation_discards_dead_connection() {
    let backend = MockBackend::new(Provider::Postgres);
    let config = no_retry(2)
        .with_min_idle(1)
        .with_validation_interval(Duration::ZERO);
    let pool = pool(&backend, config).await;

    backend.set_healthy(false);
    let lease = pool.acquire_default().await.unwrap();

    assert!(pool.checkout(&lease).is_ok());
    assert_eq!(backend.connects(), 2);
    assert_eq!(pool.stats().health_check_failures, 1);
}

#[tokio::test]
async fn test_acquire_cancelled_during_validation_frees_slot() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1).with_validation_interval(Duration::ZERO)).await;

    let lease = pool.acquire_default().await.unwrap();
    pool.release(lease).await;

    backend.set_validation_delay(Some(Duration::from_millis(200)));
    let cancelled = tokio::time::timeout(Duration::from_millis(20), pool.acquire_default()).await;
    assert!(cancelled.is_err());
    backend.set_validation_delay(None);

    let lease = pool.acquire(Duration::from_secs(1)).await.unwrap();
    assert!(pool.checkout(&lease).is_ok());
    let stats = pool.stats();
    assert_eq!(stats.open_connections, 1);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.idle_connections, 0);
    assert_eq!(backend.connects(), 2);
}

// ==================== Retry ====================

#[tokio::test]
async fn test_connect_retries_transient_failures() {
    let backend = MockBackend::new(Provider::Postgres);
    backend.fail_connects(2);
    let retry = RetryPolicy::default()
        .with_max_retries(3)
        .with_initial_delay(Duration::from_millis(1))
        .with_jitter(0.0);
    let pool = pool(&backend, PoolConfig::new(1).with_retry(retry)).await;

    let lease = pool.acquire_default().await.unwrap();
    assert!(pool.checkout(&lease).is_ok());
    assert_eq!(pool.stats().retries, 2);
}

#[tokio::test]
async fn test_connect_gives_up_after_max_retries() {
    let backend = MockBackend::new(Provider::Postgres);
    backend.fail_connects(5);
    let retry = RetryPolicy::default()
        .with_max_retries(1)
        .with_initial_delay(Duration::from_millis(1));
    let pool = pool(&backend, PoolConfig::new(1).with_retry(retry)).await;

    let err = pool.acquire_default().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);

    // The failed attempt must not leak the permit
    backend.fail_connects(0);
    assert!(pool.acquire(Duration::from_millis(200)).await.is_ok());
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_closed_pool_refuses_acquire() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(2).with_min_idle(1)).await;

    pool.close().await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(pool.stats().idle_connections, 0);

    let err = pool.acquire_default().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::PoolExhausted);
}

#[tokio::test]
async fn test_lease_returned_after_close_is_closed() {
    let backend = MockBackend::new(Provider::Postgres);
    let pool = pool(&backend, no_retry(1)).await;

    let lease = pool.acquire_default().await.unwrap();
    let conn = pool.checkout(&lease).unwrap();
    pool.close().await.unwrap();
    pool.release(lease).await;

    assert!(!conn.is_valid().await);
    assert_eq!(pool.stats().open_connections, 0);
}

#[test]
fn test_pool_stats_default() {
    let stats = PoolStats::default();

    assert_eq!(stats.connections_created, 0);
    assert_eq!(stats.acquisitions, 0);
    assert_eq!(stats.exhausted_count, 0);
    assert_eq!(stats.in_use, 0);
}
