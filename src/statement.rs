//! Prepared statements and their lifecycle tracker.
//!
//! Outside a transaction every prepared statement grabs a non-exclusive
//! checkout of its own and keeps it until the statement closes; inside a
//! transaction statements run on the transaction's exclusive connection.
//! Either way the provider tracks every live statement so the parent can
//! cascade a close-all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;

use crate::cursor::{Cursor, EndHook};
use crate::driver::{Capabilities, DriverStatement};
use crate::error::SqlConduitError;
use crate::params::{BoundParams, SqlParams};
use crate::pool::{Pool, PooledConnection};
use crate::results::{to_single_row, to_single_value, ExecResult, Row};
use crate::types::SqlValue;

/// Predicate deciding whether a new cursor may open in this scope; inside a
/// transaction it enforces the single-cursor-per-transaction rule.
pub(crate) type CursorGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A prepared statement handle.
///
/// Parameters can be bound up front (`bind*`) and merged with call-time
/// parameters at execution; call-time values win slot by slot. Closing the
/// statement closes any cursor opened from it and releases its checkout.
#[derive(Clone)]
pub struct PreparedStatement {
    inner: Arc<PsInner>,
}

impl std::fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedStatement").finish_non_exhaustive()
    }
}

struct PsInner {
    capabilities: Capabilities,
    cursor_gate: CursorGate,
    statement: Mutex<Option<Arc<dyn DriverStatement>>>,
    bound: Mutex<BoundParams>,
    cursor: Mutex<Option<Cursor>>,
    end: Mutex<Option<EndHook>>,
}

impl PreparedStatement {
    fn new(
        capabilities: Capabilities,
        cursor_gate: CursorGate,
        statement: Arc<dyn DriverStatement>,
        end: EndHook,
    ) -> Self {
        Self {
            inner: Arc::new(PsInner {
                capabilities,
                cursor_gate,
                statement: Mutex::new(Some(statement)),
                bound: Mutex::new(BoundParams::default()),
                cursor: Mutex::new(None),
                end: Mutex::new(Some(end)),
            }),
        }
    }

    /// Execute as DML with the given call-time parameters.
    ///
    /// # Errors
    /// Fails on a closed statement, on parameter-kind violations, and on
    /// driver errors.
    pub async fn exec(&self, params: SqlParams) -> Result<ExecResult, SqlConduitError> {
        self.inner.capabilities.ensure_params(&params)?;
        let statement = self.statement("exec")?;
        let merged = self.lock_bound().effective(&params)?;
        statement.exec(&merged).await
    }

    /// Run the statement and collect every row.
    ///
    /// # Errors
    /// Fails on a closed statement, on parameter-kind violations, and on
    /// driver errors.
    pub async fn query(&self, params: SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        self.inner.capabilities.ensure_params(&params)?;
        let statement = self.statement("query")?;
        let merged = self.lock_bound().effective(&params)?;
        statement.query(&merged).await
    }

    /// Run the statement expecting at most one row.
    ///
    /// # Errors
    /// Additionally fails with a cardinality error on more than one row.
    pub async fn single_row(&self, params: SqlParams) -> Result<Option<Row>, SqlConduitError> {
        to_single_row(self.query(params).await?)
    }

    /// Run the statement expecting at most one row of exactly one column.
    ///
    /// # Errors
    /// Additionally fails with a cardinality error on a multi-column row.
    pub async fn single_value(
        &self,
        params: SqlParams,
    ) -> Result<Option<SqlValue>, SqlConduitError> {
        to_single_value(self.single_row(params).await?)
    }

    /// Open a cursor over the statement's rows.
    ///
    /// # Errors
    /// Fails when the adapter lacks cursors, when a cursor is already open in
    /// this scope, on a closed statement, and on driver errors.
    pub async fn cursor(&self, params: SqlParams) -> Result<Cursor, SqlConduitError> {
        self.inner.capabilities.ensure_cursors()?;
        self.inner.capabilities.ensure_params(&params)?;
        let statement = self.statement("cursor")?;
        if self.has_cursor() || !(self.inner.cursor_gate)() {
            return Err(SqlConduitError::CursorExclusivity);
        }
        let merged = self.lock_bound().effective(&params)?;
        let driver_cursor = statement.cursor(&merged).await?;
        let weak = Arc::downgrade(&self.inner);
        let end: EndHook = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock_of(&inner.cursor).take();
            }
        });
        let cursor = Cursor::new(driver_cursor, end);
        *self.lock_cursor() = Some(cursor.clone());
        Ok(cursor)
    }

    /// Merge a whole parameter set into the bound parameters.
    ///
    /// # Errors
    /// Fails on a closed statement, on kind mixing, and on named parameters
    /// when the adapter lacks them.
    pub fn bind(&self, params: &SqlParams) -> Result<(), SqlConduitError> {
        self.inner.capabilities.ensure_params(params)?;
        self.ensure_open("bind")?;
        self.lock_bound().bind_params(params)
    }

    /// Bind one positional parameter.
    ///
    /// # Errors
    /// Fails on a closed statement and on kind mixing.
    pub fn bind_index(&self, index: usize, value: SqlValue) -> Result<(), SqlConduitError> {
        self.ensure_open("bind")?;
        self.lock_bound().bind_index(index, value)
    }

    /// Bind one named parameter.
    ///
    /// # Errors
    /// Fails on a closed statement, on kind mixing, and on adapters without
    /// named parameters.
    pub fn bind_name(&self, name: &str, value: SqlValue) -> Result<(), SqlConduitError> {
        self.inner.capabilities.ensure_named_parameters()?;
        self.ensure_open("bind")?;
        self.lock_bound().bind_name(name, value)
    }

    /// Remove one positional bind; the call-time value falls through again.
    ///
    /// # Errors
    /// Fails on a closed statement and on kind mixing.
    pub fn unbind_index(&self, index: usize) -> Result<(), SqlConduitError> {
        self.ensure_open("unbind")?;
        self.lock_bound().unbind_index(index)
    }

    /// Remove one named bind.
    ///
    /// # Errors
    /// Fails on a closed statement, on kind mixing, and on adapters without
    /// named parameters.
    pub fn unbind_name(&self, name: &str) -> Result<(), SqlConduitError> {
        self.inner.capabilities.ensure_named_parameters()?;
        self.ensure_open("unbind")?;
        self.lock_bound().unbind_name(name)
    }

    /// Drop all bound parameters.
    ///
    /// # Errors
    /// Fails on a closed statement.
    pub fn unbind_all(&self) -> Result<(), SqlConduitError> {
        self.ensure_open("unbind")?;
        self.lock_bound().clear();
        Ok(())
    }

    /// Close the statement: any open cursor goes first, then the driver
    /// statement; the statement's checkout is released either way.
    ///
    /// # Errors
    /// Fails on an already-closed statement and propagates driver errors.
    pub async fn close(&self) -> Result<(), SqlConduitError> {
        let Some(statement) = self.lock_statement().take() else {
            return Err(SqlConduitError::Closed {
                target: "prepared statement",
                method: "close",
            });
        };
        self.close_with(statement).await
    }

    pub(crate) async fn close_if_open(&self) -> Result<(), SqlConduitError> {
        let Some(statement) = self.lock_statement().take() else {
            return Ok(());
        };
        self.close_with(statement).await
    }

    async fn close_with(
        &self,
        statement: Arc<dyn DriverStatement>,
    ) -> Result<(), SqlConduitError> {
        let cursor = self.lock_cursor().take();
        let cursor_result = match cursor {
            Some(cursor) => cursor.close_if_open().await,
            None => Ok(()),
        };
        let close_result = statement.close().await;
        self.run_end();
        cursor_result?;
        close_result
    }

    pub(crate) fn has_cursor(&self) -> bool {
        self.lock_cursor().as_ref().is_some_and(Cursor::is_open)
    }

    fn ensure_open(&self, method: &'static str) -> Result<(), SqlConduitError> {
        if self.lock_statement().is_some() {
            Ok(())
        } else {
            Err(SqlConduitError::Closed {
                target: "prepared statement",
                method,
            })
        }
    }

    fn statement(
        &self,
        method: &'static str,
    ) -> Result<Arc<dyn DriverStatement>, SqlConduitError> {
        self.lock_statement()
            .clone()
            .ok_or(SqlConduitError::Closed {
                target: "prepared statement",
                method,
            })
    }

    fn run_end(&self) {
        if let Some(hook) = lock_of(&self.inner.end).take() {
            hook();
        }
    }

    fn lock_statement(&self) -> MutexGuard<'_, Option<Arc<dyn DriverStatement>>> {
        lock_of(&self.inner.statement)
    }

    fn lock_bound(&self) -> MutexGuard<'_, BoundParams> {
        lock_of(&self.inner.bound)
    }

    fn lock_cursor(&self) -> MutexGuard<'_, Option<Cursor>> {
        lock_of(&self.inner.cursor)
    }
}

fn lock_of<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tracks the prepared statements of one scope (main connection or one
/// transaction) for cascading close.
#[derive(Clone)]
pub(crate) struct PsProvider {
    inner: Arc<PsProviderInner>,
}

struct PsProviderInner {
    pool: Pool,
    capabilities: Capabilities,
    /// Set inside a transaction: statements run on this connection instead of
    /// grabbing their own checkout.
    exclusive: Option<PooledConnection>,
    cursor_gate: CursorGate,
    items: Mutex<HashMap<u64, PreparedStatement>>,
    next_id: AtomicU64,
}

impl PsProvider {
    pub(crate) fn new(
        pool: Pool,
        capabilities: Capabilities,
        exclusive: Option<PooledConnection>,
        cursor_gate: CursorGate,
    ) -> Self {
        Self {
            inner: Arc::new(PsProviderInner {
                pool,
                capabilities,
                exclusive,
                cursor_gate,
                items: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) async fn prepare(&self, sql: &str) -> Result<PreparedStatement, SqlConduitError> {
        let (conn, owns_checkout) = match &self.inner.exclusive {
            Some(conn) => (conn.clone(), false),
            None => (self.inner.pool.grab(false).await?, true),
        };
        let statement = match conn.driver().prepare(sql).await {
            Ok(statement) => statement,
            Err(err) => {
                if owns_checkout {
                    self.inner.pool.release(conn);
                }
                return Err(err);
            }
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let provider = Arc::downgrade(&self.inner);
        let pool = self.inner.pool.clone();
        let release_conn = owns_checkout.then(|| conn.clone());
        let end: EndHook = Box::new(move || {
            if let Some(provider) = provider.upgrade() {
                lock_of(&provider.items).remove(&id);
            }
            if let Some(conn) = release_conn {
                pool.release(conn);
            }
        });
        let statement = PreparedStatement::new(
            self.inner.capabilities,
            self.inner.cursor_gate.clone(),
            Arc::from(statement),
            end,
        );
        lock_of(&self.inner.items).insert(id, statement.clone());
        Ok(statement)
    }

    /// True when any tracked statement currently holds an open cursor.
    pub(crate) fn has_cursor(&self) -> bool {
        lock_of(&self.inner.items)
            .values()
            .any(PreparedStatement::has_cursor)
    }

    /// Close every still-open statement concurrently, propagating the first
    /// driver error after all closes were attempted.
    pub(crate) async fn close_all(&self) -> Result<(), SqlConduitError> {
        let items: Vec<PreparedStatement> =
            lock_of(&self.inner.items).values().cloned().collect();
        let results = join_all(items.iter().map(PreparedStatement::close_if_open)).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }
}
