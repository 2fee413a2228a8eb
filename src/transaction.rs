//! Transactions and their lifecycle tracker.
//!
//! A transaction holds an exclusive pool checkout from `begin` until
//! `commit` or `rollback`. Teardown order matters: dependent cursors and
//! prepared statements close first (concurrently), then the vendor command
//! runs, and only a fully clean teardown returns the connection to the pool;
//! anything else abandons it, since its state can no longer be trusted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;

use crate::connection::ConnCtx;
use crate::cursor::{Cursor, EndHook};
use crate::driver::ScriptSupport;
use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::pool::PooledConnection;
use crate::results::{to_single_row, to_single_value, ExecResult, Row};
use crate::statement::{CursorGate, PreparedStatement, PsProvider};
use crate::types::SqlValue;

/// An open transaction over an exclusively-held connection.
///
/// Terminal states are committed and rolled back; after either, every
/// operation fails with a not-in-a-transaction usage error.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

struct TxInner {
    ctx: Arc<ConnCtx>,
    body: Mutex<TxBody>,
    end: Mutex<Option<EndHook>>,
}

#[derive(Default)]
struct TxBody {
    conn: Option<PooledConnection>,
    statements: Option<PsProvider>,
    cursor: Option<Cursor>,
}

impl Transaction {
    fn new(ctx: Arc<ConnCtx>, conn: PooledConnection, end: EndHook) -> Self {
        Self {
            inner: Arc::new(TxInner {
                ctx,
                body: Mutex::new(TxBody {
                    conn: Some(conn),
                    statements: None,
                    cursor: None,
                }),
                end: Mutex::new(Some(end)),
            }),
        }
    }

    /// Whether the transaction is still active.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.lock_body().conn.is_some()
    }

    /// Execute a DML statement inside the transaction.
    ///
    /// # Errors
    /// Fails once the transaction has ended, on parameter-kind violations,
    /// and on driver errors.
    pub async fn exec(
        &self,
        sql: &str,
        params: SqlParams,
    ) -> Result<ExecResult, SqlConduitError> {
        self.inner.ctx.capabilities.ensure_params(&params)?;
        let conn = self.conn("exec")?;
        conn.driver().exec(sql, &params).await
    }

    /// Run a query inside the transaction and collect every row.
    ///
    /// # Errors
    /// Fails once the transaction has ended, on parameter-kind violations,
    /// and on driver errors.
    pub async fn query(&self, sql: &str, params: SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        self.inner.ctx.capabilities.ensure_params(&params)?;
        let conn = self.conn("query")?;
        conn.driver().query(sql, &params).await
    }

    /// Like [`Transaction::query`] but expecting at most one row.
    ///
    /// # Errors
    /// Additionally fails with a cardinality error on more than one row.
    pub async fn single_row(
        &self,
        sql: &str,
        params: SqlParams,
    ) -> Result<Option<Row>, SqlConduitError> {
        to_single_row(self.query(sql, params).await?)
    }

    /// Like [`Transaction::single_row`] but reducing to the row's only value.
    ///
    /// # Errors
    /// Additionally fails with a cardinality error on a multi-column row.
    pub async fn single_value(
        &self,
        sql: &str,
        params: SqlParams,
    ) -> Result<Option<SqlValue>, SqlConduitError> {
        to_single_value(self.single_row(sql, params).await?)
    }

    /// Prepare a statement on the transaction's exclusive connection.
    ///
    /// # Errors
    /// Fails when the adapter lacks prepared statements, once the transaction
    /// has ended, and on driver errors.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement, SqlConduitError> {
        self.inner.ctx.capabilities.ensure_prepared_statements()?;
        let provider = {
            let mut body = self.lock_body();
            let Some(conn) = body.conn.clone() else {
                return Err(SqlConduitError::NotInTransaction("prepare"));
            };
            body.statements
                .get_or_insert_with(|| {
                    let weak = Arc::downgrade(&self.inner);
                    let gate: CursorGate = Arc::new(move || {
                        weak.upgrade()
                            .is_some_and(|tx| can_create_cursor(&lock_body_of(&tx)))
                    });
                    PsProvider::new(
                        self.inner.ctx.pool.clone(),
                        self.inner.ctx.capabilities,
                        Some(conn),
                        gate,
                    )
                })
                .clone()
        };
        provider.prepare(sql).await
    }

    /// Open a cursor inside the transaction. At most one cursor may be open
    /// per transaction, whether opened directly or through a prepared
    /// statement, because most drivers serialize cursor state per connection.
    ///
    /// # Errors
    /// Fails when the adapter lacks cursors, when a cursor is already open,
    /// once the transaction has ended, and on driver errors.
    pub async fn cursor(&self, sql: &str, params: SqlParams) -> Result<Cursor, SqlConduitError> {
        self.inner.ctx.capabilities.ensure_cursors()?;
        self.inner.ctx.capabilities.ensure_params(&params)?;
        let conn = {
            let body = self.lock_body();
            let Some(conn) = body.conn.clone() else {
                return Err(SqlConduitError::NotInTransaction("cursor"));
            };
            if !can_create_cursor(&body) {
                return Err(SqlConduitError::CursorExclusivity);
            }
            conn
        };
        let driver_cursor = conn.driver().cursor(sql, &params).await?;
        let weak = Arc::downgrade(&self.inner);
        let end: EndHook = Box::new(move || {
            if let Some(tx) = weak.upgrade() {
                lock_body_of(&tx).cursor.take();
            }
        });
        let cursor = Cursor::new(driver_cursor, end);
        self.lock_body().cursor = Some(cursor.clone());
        Ok(cursor)
    }

    /// Run a script inside the transaction.
    ///
    /// # Errors
    /// Fails when the adapter lacks scripts or only runs them on a dedicated
    /// connection, once the transaction has ended, and on driver errors.
    pub async fn script(&self, sql: &str) -> Result<(), SqlConduitError> {
        self.inner.ctx.capabilities.ensure_script()?;
        if self.inner.ctx.capabilities.script == ScriptSupport::SeparateConnection {
            return Err(SqlConduitError::ScriptOnMainConnectionOnly);
        }
        let conn = self.conn("script")?;
        conn.driver().script(sql).await
    }

    /// Commit the transaction and release its connection to the pool.
    ///
    /// # Errors
    /// Fails once the transaction has ended. Any dependency-teardown or
    /// commit-command error abandons the connection and is re-thrown.
    pub async fn commit(&self) -> Result<(), SqlConduitError> {
        self.end_transaction("commit", true).await
    }

    /// Roll the transaction back and release its connection to the pool.
    ///
    /// # Errors
    /// Fails once the transaction has ended. Any dependency-teardown or
    /// rollback-command error abandons the connection and is re-thrown.
    pub async fn rollback(&self) -> Result<(), SqlConduitError> {
        self.end_transaction("rollback", false).await
    }

    /// Rollback used by cascading close: a no-op when the transaction already
    /// ended.
    pub(crate) async fn rollback_if_active(&self) -> Result<(), SqlConduitError> {
        match self.end_transaction("rollback", false).await {
            Err(SqlConduitError::NotInTransaction(_)) => Ok(()),
            other => other,
        }
    }

    async fn end_transaction(
        &self,
        method: &'static str,
        commit: bool,
    ) -> Result<(), SqlConduitError> {
        let (conn, statements, cursor) = {
            let mut body = self.lock_body();
            let Some(conn) = body.conn.take() else {
                return Err(SqlConduitError::NotInTransaction(method));
            };
            (conn, body.statements.take(), body.cursor.take())
        };
        self.run_end();

        let teardown = async {
            let close_cursor = async {
                match &cursor {
                    Some(cursor) => cursor.close_if_open().await,
                    None => Ok(()),
                }
            };
            let close_statements = async {
                match &statements {
                    Some(statements) => statements.close_all().await,
                    None => Ok(()),
                }
            };
            let (cursor_result, statements_result) = tokio::join!(close_cursor, close_statements);
            cursor_result?;
            statements_result?;
            if commit {
                self.inner.ctx.adapter.commit(conn.driver()).await
            } else {
                self.inner.ctx.adapter.rollback(conn.driver()).await
            }
        };
        match teardown.await {
            Ok(()) => {
                self.inner.ctx.pool.release(conn);
                Ok(())
            }
            Err(err) => {
                self.inner.ctx.pool.abandon(conn);
                Err(err)
            }
        }
    }

    fn conn(&self, method: &'static str) -> Result<PooledConnection, SqlConduitError> {
        self.lock_body()
            .conn
            .clone()
            .ok_or(SqlConduitError::NotInTransaction(method))
    }

    fn run_end(&self) {
        let hook = match self.inner.end.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    fn lock_body(&self) -> MutexGuard<'_, TxBody> {
        lock_body_of(&self.inner)
    }
}

fn lock_body_of(inner: &TxInner) -> MutexGuard<'_, TxBody> {
    match inner.body.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn can_create_cursor(body: &TxBody) -> bool {
    let direct_cursor_open = body
        .cursor
        .as_ref()
        .is_some_and(Cursor::is_open);
    let statement_cursor_open = body
        .statements
        .as_ref()
        .is_some_and(PsProvider::has_cursor);
    !direct_cursor_open && !statement_cursor_open
}

/// Tracks the open transactions of one main connection so its close can roll
/// them all back.
#[derive(Clone)]
pub(crate) struct TxProvider {
    inner: Arc<TxProviderInner>,
}

struct TxProviderInner {
    ctx: Arc<ConnCtx>,
    items: Mutex<HashMap<u64, Transaction>>,
    next_id: AtomicU64,
}

impl TxProvider {
    pub(crate) fn new(ctx: Arc<ConnCtx>) -> Self {
        Self {
            inner: Arc::new(TxProviderInner {
                ctx,
                items: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) async fn begin(&self) -> Result<Transaction, SqlConduitError> {
        let ctx = &self.inner.ctx;
        let conn = ctx.pool.grab(true).await?;
        if let Err(err) = ctx.adapter.begin(conn.driver()).await {
            ctx.pool.release(conn);
            return Err(err);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let provider = Arc::downgrade(&self.inner);
        let end: EndHook = Box::new(move || {
            if let Some(provider) = provider.upgrade() {
                lock_items_of(&provider).remove(&id);
            }
        });
        let tx = Transaction::new(ctx.clone(), conn, end);
        lock_items_of(&self.inner).insert(id, tx.clone());
        Ok(tx)
    }

    /// Roll back every still-open transaction concurrently.
    pub(crate) async fn close_all(&self) -> Result<(), SqlConduitError> {
        let items: Vec<Transaction> = lock_items_of(&self.inner).values().cloned().collect();
        let results = join_all(items.iter().map(Transaction::rollback_if_active)).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}

fn lock_items_of(inner: &TxProviderInner) -> MutexGuard<'_, HashMap<u64, Transaction>> {
    match inner.items.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
