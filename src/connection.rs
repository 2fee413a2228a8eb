//! The main connection facade.
//!
//! One [`Connection`] fronts the whole layer: it owns the pool and the three
//! lifecycle trackers (prepared statements, cursors, transactions) and checks
//! adapter capabilities before every dispatch. Simple operations borrow a
//! non-exclusive checkout for just one driver call; prepared statements,
//! cursors and transactions hold a checkout for their whole lifetime through
//! their trackers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::cursor::{Cursor, CursorProvider};
use crate::driver::{Capabilities, DriverAdapter, ScriptSupport};
use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::pool::{Pool, PoolOptions, PoolStats};
use crate::results::{to_single_row, to_single_value, ExecResult, Row};
use crate::statement::{PreparedStatement, PsProvider};
use crate::transaction::{Transaction, TxProvider};
use crate::types::SqlValue;

/// Options for building a [`Connection`].
#[derive(Debug, Clone, Default)]
pub struct ConduitOptions {
    pub pool: PoolOptions,
    /// Wrap every driver connection in the debug decorator, tracing each
    /// driver call as a structured event.
    pub debug_log: bool,
}

/// Shared context handed to the lifecycle trackers.
pub(crate) struct ConnCtx {
    pub(crate) pool: Pool,
    pub(crate) adapter: Arc<dyn DriverAdapter>,
    pub(crate) capabilities: Capabilities,
}

/// The public database connection.
///
/// State machine: open until [`Connection::close`], which is terminal and
/// cascades through every live statement, cursor and transaction before
/// closing the pool.
pub struct Connection {
    ctx: Arc<ConnCtx>,
    closed: AtomicBool,
    statements: PsProvider,
    cursors: CursorProvider,
    transactions: TxProvider,
}

impl Connection {
    /// Build a connection over a driver adapter. No physical connection is
    /// opened until the first operation needs one.
    #[must_use]
    pub fn open(adapter: Arc<dyn DriverAdapter>, options: ConduitOptions) -> Self {
        let capabilities = adapter.capabilities();
        let pool = Pool::new(adapter.clone(), options.pool, options.debug_log);
        let ctx = Arc::new(ConnCtx {
            pool: pool.clone(),
            adapter,
            capabilities,
        });
        // Cursors opened on the main connection each hold their own checkout,
        // so nothing constrains statement cursors here.
        let statements = PsProvider::new(pool.clone(), capabilities, None, Arc::new(|| true));
        let cursors = CursorProvider::new(pool);
        let transactions = TxProvider::new(ctx.clone());
        Self {
            ctx,
            closed: AtomicBool::new(false),
            statements,
            cursors,
            transactions,
        }
    }

    /// Capability flags of the underlying adapter.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.ctx.capabilities
    }

    /// Pool bookkeeping snapshot.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.ctx.pool.stats()
    }

    /// Execute a DML statement.
    ///
    /// # Errors
    /// Fails on a closed connection, on parameter-kind violations, and on
    /// driver errors.
    pub async fn exec(&self, sql: &str, params: SqlParams) -> Result<ExecResult, SqlConduitError> {
        self.ensure_open("exec")?;
        self.ctx.capabilities.ensure_params(&params)?;
        let conn = self.ctx.pool.grab(false).await?;
        let result = conn.driver().exec(sql, &params).await;
        self.ctx.pool.release(conn);
        result
    }

    /// Run a query and collect every row.
    ///
    /// # Errors
    /// Fails on a closed connection, on parameter-kind violations, and on
    /// driver errors.
    pub async fn query(&self, sql: &str, params: SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        self.ensure_open("query")?;
        self.ctx.capabilities.ensure_params(&params)?;
        let conn = self.ctx.pool.grab(false).await?;
        let result = conn.driver().query(sql, &params).await;
        self.ctx.pool.release(conn);
        result
    }

    /// Run a query expecting at most one row.
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

    /// Run a query expecting at most one row of exactly one column.
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

    /// Prepare a statement. The statement grabs a non-exclusive checkout of
    /// its own and keeps it until closed.
    ///
    /// # Errors
    /// Fails on a closed connection, on adapters without prepared statements,
    /// and on driver errors.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement, SqlConduitError> {
        self.ctx.capabilities.ensure_prepared_statements()?;
        self.ensure_open("prepare")?;
        self.statements.prepare(sql).await
    }

    /// Open a cursor. The cursor grabs a non-exclusive checkout of its own
    /// and keeps it until exhausted or closed.
    ///
    /// # Errors
    /// Fails on a closed connection, on adapters without cursors, and on
    /// driver errors.
    pub async fn cursor(&self, sql: &str, params: SqlParams) -> Result<Cursor, SqlConduitError> {
        self.ctx.capabilities.ensure_cursors()?;
        self.ensure_open("cursor")?;
        self.ctx.capabilities.ensure_params(&params)?;
        self.cursors.open(sql, &params).await
    }

    /// Run a multi-statement script.
    ///
    /// Adapters reporting [`ScriptSupport::SeparateConnection`] get an
    /// exclusive checkout for it, so the script never interleaves with shared
    /// non-exclusive traffic.
    ///
    /// # Errors
    /// Fails on a closed connection, on adapters without scripts, and on
    /// driver errors.
    pub async fn script(&self, sql: &str) -> Result<(), SqlConduitError> {
        self.ensure_open("script")?;
        self.ctx.capabilities.ensure_script()?;
        let exclusive = self.ctx.capabilities.script == ScriptSupport::SeparateConnection;
        let conn = self.ctx.pool.grab(exclusive).await?;
        let result = conn.driver().script(sql).await;
        self.ctx.pool.release(conn);
        result
    }

    /// Begin a transaction on an exclusive checkout. Concurrent transactions
    /// run on independent physical connections.
    ///
    /// # Errors
    /// Fails on a closed connection and propagates adapter open/begin errors.
    pub async fn begin_transaction(&self) -> Result<Transaction, SqlConduitError> {
        self.ensure_open("beginTransaction")?;
        self.transactions.begin().await
    }

    /// Close the connection. Terminal: open statements and cursors are
    /// closed, open transactions are rolled back (all concurrently), then the
    /// pool itself closes.
    ///
    /// # Errors
    /// Fails when called twice and propagates the first teardown error.
    pub async fn close(&self) -> Result<(), SqlConduitError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SqlConduitError::Closed {
                target: "connection",
                method: "close",
            });
        }
        let (statements, cursors, transactions) = tokio::join!(
            self.statements.close_all(),
            self.cursors.close_all(),
            self.transactions.close_all()
        );
        statements?;
        cursors?;
        transactions?;
        self.ctx.pool.close().await
    }

    fn ensure_open(&self, method: &'static str) -> Result<(), SqlConduitError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SqlConduitError::Closed {
                target: "connection",
                method,
            })
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("pool", &self.ctx.pool)
            .finish_non_exhaustive()
    }
}
