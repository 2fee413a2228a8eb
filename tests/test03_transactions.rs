use std::sync::Arc;

use sql_conduit::test_utils::{row, MemoryAdapter};
use sql_conduit::{ConduitOptions, Connection, SqlConduitError, SqlParams, SqlValue};

fn connect(adapter: &MemoryAdapter) -> Connection {
    Connection::open(Arc::new(adapter.clone()), ConduitOptions::default())
}

/// A committed transaction runs begin / statements / commit on one exclusive
/// connection and hands that connection back for the next transaction.
#[tokio::test(flavor = "current_thread")]
async fn commit_releases_the_connection_for_reuse() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx = db.begin_transaction().await?;
    assert!(tx.in_transaction());
    tx.exec("update account set n = n + 1", SqlParams::empty())
        .await?;
    tx.commit().await?;
    assert!(!tx.in_transaction());

    assert_eq!(
        adapter.journal(),
        [
            "open#1",
            "exec#1:begin",
            "exec#1:update account set n = n + 1",
            "exec#1:commit",
        ]
    );
    assert_eq!(db.pool_stats().idle, 1);

    let tx = db.begin_transaction().await?;
    tx.rollback().await?;
    assert_eq!(adapter.opened_connections(), 1);
    assert!(adapter.journal().contains(&"exec#1:rollback".to_string()));
    Ok(())
}

/// Concurrent transactions never share a physical connection.
#[tokio::test(flavor = "current_thread")]
async fn concurrent_transactions_use_distinct_connections() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx1 = db.begin_transaction().await?;
    let tx2 = db.begin_transaction().await?;
    assert_eq!(adapter.opened_connections(), 2);

    tx1.exec("a", SqlParams::empty()).await?;
    tx2.exec("b", SqlParams::empty()).await?;
    tx1.commit().await?;
    tx2.commit().await?;

    let journal = adapter.journal();
    assert!(journal.contains(&"exec#1:a".to_string()));
    assert!(journal.contains(&"exec#2:b".to_string()));
    assert_eq!(db.pool_stats().idle, 2);
    Ok(())
}

/// After commit or rollback every operation fails as not-in-a-transaction,
/// and ending twice fails the same way.
#[tokio::test(flavor = "current_thread")]
async fn ended_transactions_reject_operations() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx = db.begin_transaction().await?;
    tx.commit().await?;

    let err = tx.exec("x", SqlParams::empty()).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid call to 'exec', not in a transaction");
    assert!(matches!(
        tx.query("x", SqlParams::empty()).await,
        Err(SqlConduitError::NotInTransaction("query"))
    ));
    assert!(matches!(
        tx.commit().await,
        Err(SqlConduitError::NotInTransaction("commit"))
    ));
    assert!(matches!(
        tx.rollback().await,
        Err(SqlConduitError::NotInTransaction("rollback"))
    ));
    Ok(())
}

/// One cursor at a time per transaction, counting cursors opened through
/// prepared statements; closing the cursor frees the slot.
#[tokio::test(flavor = "current_thread")]
async fn single_cursor_per_transaction() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);
    let tx = db.begin_transaction().await?;

    adapter.push_rows(vec![row(&["n"], vec![SqlValue::Int(1)])]);
    let cursor = tx.cursor("select n", SqlParams::empty()).await?;
    assert!(matches!(
        tx.cursor("select n", SqlParams::empty()).await,
        Err(SqlConduitError::CursorExclusivity)
    ));

    let stmt = tx.prepare("select m").await?;
    assert!(matches!(
        stmt.cursor(SqlParams::empty()).await,
        Err(SqlConduitError::CursorExclusivity)
    ));

    cursor.close().await?;
    let stmt_cursor = stmt.cursor(SqlParams::empty()).await?;
    assert!(matches!(
        tx.cursor("select n", SqlParams::empty()).await,
        Err(SqlConduitError::CursorExclusivity)
    ));
    stmt_cursor.close().await?;

    tx.cursor("select n", SqlParams::empty()).await?;
    tx.rollback().await?;
    Ok(())
}

/// A failed commit abandons the connection: it is closed, never re-pooled,
/// and the error reaches the caller.
#[tokio::test(flavor = "current_thread")]
async fn failed_commit_abandons_the_connection() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx = db.begin_transaction().await?;
    adapter.fail_on("commit");
    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.to_string(), "Execution error: forced failure: commit");
    assert!(!tx.in_transaction());

    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(db.pool_stats().idle, 0);
    assert_eq!(adapter.live_connections(), 0);
    Ok(())
}

/// Statements prepared inside a transaction run on the transaction's
/// connection and close before the commit command goes out.
#[tokio::test(flavor = "current_thread")]
async fn transaction_statements_ride_the_exclusive_connection() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx = db.begin_transaction().await?;
    let stmt = tx.prepare("insert into t (a) values (?)").await?;
    stmt.exec(SqlParams::from(vec![SqlValue::Int(7)])).await?;
    assert_eq!(adapter.opened_connections(), 1);

    tx.commit().await?;
    let journal = adapter.journal();
    let close_at = journal
        .iter()
        .position(|entry| entry.starts_with("stmt-close#1"))
        .unwrap();
    let commit_at = journal
        .iter()
        .position(|entry| entry == "exec#1:commit")
        .unwrap();
    assert!(close_at < commit_at);
    assert!(matches!(
        stmt.exec(SqlParams::empty()).await,
        Err(SqlConduitError::Closed { .. })
    ));
    Ok(())
}

/// Closing the facade rolls open transactions back before the pool shuts
/// down.
#[tokio::test(flavor = "current_thread")]
async fn facade_close_rolls_back_open_transactions() -> Result<(), SqlConduitError> {
    let adapter = MemoryAdapter::new();
    let db = connect(&adapter);

    let tx = db.begin_transaction().await?;
    tx.exec("update t set a = 1", SqlParams::empty()).await?;
    db.close().await?;

    assert!(!tx.in_transaction());
    assert!(adapter.journal().contains(&"exec#1:rollback".to_string()));
    assert_eq!(adapter.live_connections(), 0);
    Ok(())
}
