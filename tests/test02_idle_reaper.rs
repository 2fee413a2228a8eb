use std::sync::Arc;
use std::time::Duration;

use sql_conduit::pool::{Pool, PoolOptions};
use sql_conduit::test_utils::MemoryAdapter;
use sql_conduit::SqlConduitError;

fn pool_with_ttl(adapter: &MemoryAdapter, ttl: Duration, keep_one: bool) -> Pool {
    Pool::new(
        Arc::new(adapter.clone()),
        PoolOptions {
            connection_ttl: Some(ttl),
            keep_one_connection: keep_one,
            ..PoolOptions::default()
        },
        false,
    )
}

/// An idle connection older than the TTL gets closed by the reaper.
#[tokio::test(start_paused = true)]
async fn reaper_closes_connections_past_ttl() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with_ttl(&adapter, Duration::from_millis(1500), false);

    let conn = pool.grab(true).await?;
    pool.release(conn);
    assert_eq!(pool.stats().idle, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;

    assert_eq!(pool.stats().idle, 0);
    assert_eq!(adapter.live_connections(), 0);
    Ok(())
}

/// Connections younger than the TTL survive every sweep.
#[tokio::test(start_paused = true)]
async fn fresh_connections_survive_sweeps() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with_ttl(&adapter, Duration::from_secs(30), false);

    let conn = pool.grab(true).await?;
    pool.release(conn);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(adapter.live_connections(), 1);
    Ok(())
}

/// With `keep_one_connection` the newest idle connection outlives its TTL so a
/// bursty caller never pays a cold open; older ones still age out.
#[tokio::test(start_paused = true)]
async fn keep_one_connection_retains_the_newest() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with_ttl(&adapter, Duration::from_secs(1), true);

    let a = pool.grab(true).await?;
    let b = pool.grab(true).await?;
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.stats().idle, 2);

    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;

    assert_eq!(pool.stats().idle, 1);
    assert_eq!(adapter.live_connections(), 1);
    Ok(())
}

/// The reaper parks itself after enough empty sweeps and a later release
/// starts it again.
#[tokio::test(start_paused = true)]
async fn reaper_restarts_after_going_idle() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with_ttl(&adapter, Duration::from_secs(1), false);

    let conn = pool.grab(true).await?;
    pool.release(conn);

    // Long enough for the sweep plus the ten empty sweeps that stop the task.
    tokio::time::sleep(Duration::from_secs(20)).await;
    tokio::task::yield_now().await;
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(adapter.live_connections(), 0);

    let conn = pool.grab(true).await?;
    pool.release(conn);
    assert_eq!(pool.stats().idle, 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert_eq!(pool.stats().idle, 0);
    assert_eq!(adapter.live_connections(), 0);
    assert_eq!(adapter.opened_connections(), 2);
    Ok(())
}
