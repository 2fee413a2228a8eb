use std::sync::{Arc, Mutex};
use std::time::Duration;

use sql_conduit::pool::{Pool, PoolEventKind, PoolOptions};
use sql_conduit::test_utils::MemoryAdapter;
use sql_conduit::SqlConduitError;

fn pool_with(adapter: &MemoryAdapter, options: PoolOptions) -> Pool {
    Pool::new(Arc::new(adapter.clone()), options, false)
}

/// Non-exclusive grabs pile onto one shared physical connection; the
/// connection only goes back to the idle stack once the last holder releases.
#[tokio::test(flavor = "current_thread")]
async fn non_exclusive_grabs_share_one_connection() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let a = pool.grab(false).await?;
    let b = pool.grab(false).await?;
    assert_eq!(a.id(), b.id());
    assert_eq!(adapter.opened_connections(), 1);
    assert_eq!(pool.stats().non_exclusive_holders, 2);

    pool.release(a);
    assert_eq!(pool.stats().non_exclusive_holders, 1);
    assert_eq!(pool.stats().idle, 0);

    pool.release(b);
    assert_eq!(pool.stats().non_exclusive_holders, 0);
    assert_eq!(pool.stats().idle, 1);
    Ok(())
}

/// Exclusive grabs never share, not with each other and not with the shared
/// non-exclusive connection.
#[tokio::test(flavor = "current_thread")]
async fn exclusive_grabs_get_distinct_connections() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let shared = pool.grab(false).await?;
    let tx1 = pool.grab(true).await?;
    let tx2 = pool.grab(true).await?;
    assert_ne!(tx1.id(), tx2.id());
    assert_ne!(tx1.id(), shared.id());
    assert_eq!(adapter.opened_connections(), 3);

    pool.release(shared);
    pool.release(tx1);
    pool.release(tx2);
    assert_eq!(pool.stats().idle, 3);
    Ok(())
}

/// The idle stack is LIFO: the most recently released connection is reused
/// first, leaving older ones to age out.
#[tokio::test(flavor = "current_thread")]
async fn idle_reuse_is_lifo() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let a = pool.grab(true).await?;
    let b = pool.grab(true).await?;
    let (a_id, b_id) = (a.id(), b.id());
    pool.release(b);
    pool.release(a);

    let reused = pool.grab(true).await?;
    assert_eq!(reused.id(), a_id);
    let next = pool.grab(true).await?;
    assert_eq!(next.id(), b_id);
    assert_eq!(adapter.opened_connections(), 2);
    Ok(())
}

/// Closing the pool is terminal: idle connections close, later grabs fail and
/// a second close fails too.
#[tokio::test(flavor = "current_thread")]
async fn close_is_terminal() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let conn = pool.grab(true).await?;
    pool.release(conn);
    pool.close().await?;
    assert_eq!(adapter.live_connections(), 0);
    assert!(pool.stats().closed);

    let err = pool.grab(false).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid call to 'grab', the pool is closed"
    );
    assert!(matches!(pool.close().await, Err(SqlConduitError::Closed { .. })));
    Ok(())
}

/// A connection still checked out when the pool closes is swept as soon as it
/// comes back instead of being re-pooled.
#[tokio::test(flavor = "current_thread")]
async fn release_after_close_discards_the_connection() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let straggler = pool.grab(true).await?;
    pool.close().await?;
    pool.release(straggler);

    // The discard close runs on a spawned task.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(adapter.live_connections(), 0);
    assert_eq!(pool.stats().idle, 0);
    Ok(())
}

/// Abandoned connections are closed and never return to the idle stack, and
/// their close errors go to the error-log callback instead of any caller.
#[tokio::test(flavor = "current_thread")]
async fn abandon_discards_and_reports_close_errors() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let logged: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = logged.clone();
    let pool = pool_with(
        &adapter,
        PoolOptions {
            log_error: Some(Arc::new(move |err| {
                sink.lock().unwrap().push(err.to_string());
            })),
            ..PoolOptions::default()
        },
    );

    adapter.fail_on("close");
    let conn = pool.grab(true).await?;
    pool.abandon(conn);
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert_eq!(pool.stats().idle, 0);
    assert_eq!(adapter.live_connections(), 0);
    assert_eq!(
        logged.lock().unwrap().as_slice(),
        ["Connection error: forced failure: close"]
    );
    Ok(())
}

/// Unlike the fire-and-forget abandon path, `close` is awaited and surfaces
/// driver close errors to the caller.
#[tokio::test(flavor = "current_thread")]
async fn close_propagates_driver_errors() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let pool = pool_with(&adapter, PoolOptions::default());

    let conn = pool.grab(true).await?;
    pool.release(conn);
    adapter.fail_on("close");

    let err = pool.close().await.unwrap_err();
    assert_eq!(err.to_string(), "Connection error: forced failure: close");
    assert!(pool.stats().closed);
    Ok(())
}

/// Every pool state change surfaces through the monitoring callback.
#[tokio::test(flavor = "current_thread")]
async fn monitor_sees_the_connection_lifecycle() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let events: Arc<Mutex<Vec<(PoolEventKind, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let pool = pool_with(
        &adapter,
        PoolOptions {
            connection_ttl: Some(Duration::from_secs(60)),
            monitor: Some(Arc::new(move |event| {
                sink.lock().unwrap().push((event.kind, event.connection_id));
            })),
            ..PoolOptions::default()
        },
    );

    let conn = pool.grab(false).await?;
    let id = conn.id();
    pool.release(conn);
    pool.close().await?;

    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            (PoolEventKind::Open, id),
            (PoolEventKind::Grab, id),
            (PoolEventKind::Release, id),
            (PoolEventKind::Close, id),
        ]
    );
    Ok(())
}
