//! In-memory scriptable driver adapter for tests.
//!
//! `MemoryAdapter` records every driver call in a journal, counts live
//! physical connections, serves canned result rows, and injects failures for
//! chosen SQL strings. It implements the full capability surface by default
//! so the facade's checks can be exercised both ways.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::driver::{
    Capabilities, DriverAdapter, DriverConnection, DriverCursor, DriverStatement,
};
use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::results::{ExecResult, Row};
use crate::types::SqlValue;

/// Build a [`Row`] from column names and values.
#[must_use]
pub fn row(columns: &[&str], values: Vec<SqlValue>) -> Row {
    Row::new(
        Arc::new(columns.iter().map(ToString::to_string).collect()),
        values,
    )
}

/// Scriptable in-memory adapter. Cloning shares the same backing state, so a
/// test can keep a handle while the connection owns another.
#[derive(Clone)]
pub struct MemoryAdapter {
    capabilities: Capabilities,
    state: Arc<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    journal: Mutex<Vec<String>>,
    opened: AtomicU64,
    live: AtomicI64,
    canned_rows: Mutex<VecDeque<Vec<Row>>>,
    failures: Mutex<HashSet<String>>,
    inserted_id: Mutex<Option<SqlValue>>,
}

impl MemoryAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::all())
    }

    #[must_use]
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            state: Arc::new(MemoryState::default()),
        }
    }

    /// Everything the driver side has been asked to do, in order.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.state.lock_journal().clone()
    }

    /// Physical connections currently open (opened minus closed).
    #[must_use]
    pub fn live_connections(&self) -> i64 {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Physical connections ever opened.
    #[must_use]
    pub fn opened_connections(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Queue one result set; each query or cursor open consumes one queued
    /// set (front first), defaulting to no rows.
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.state.lock_canned().push_back(rows);
    }

    /// Make any exec/query/script carrying exactly this SQL fail. The special
    /// string `"close"` makes connection closes fail.
    pub fn fail_on(&self, sql: &str) {
        self.state.lock_failures().insert(sql.to_string());
    }

    pub fn clear_failure(&self, sql: &str) {
        self.state.lock_failures().remove(sql);
    }

    /// Id reported by subsequent exec results, `None` for no id.
    pub fn set_inserted_id(&self, id: Option<SqlValue>) {
        *self.state.lock_inserted_id() = id;
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverAdapter for MemoryAdapter {
    async fn open(&self) -> Result<Box<dyn DriverConnection>, SqlConduitError> {
        if self.state.has_failure("open") {
            return Err(SqlConduitError::ConnectionError(
                "forced failure: open".to_string(),
            ));
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.live.fetch_add(1, Ordering::SeqCst);
        self.state.record(format!("open#{id}"));
        Ok(Box::new(MemoryConnection {
            id,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl MemoryState {
    fn record(&self, entry: String) {
        self.lock_journal().push(entry);
    }

    fn has_failure(&self, sql: &str) -> bool {
        self.lock_failures().contains(sql)
    }

    fn next_rows(&self) -> Vec<Row> {
        self.lock_canned().pop_front().unwrap_or_default()
    }

    fn exec_result(&self) -> ExecResult {
        ExecResult {
            affected_rows: 1,
            inserted_id: self.lock_inserted_id().clone(),
        }
    }

    fn lock_journal(&self) -> MutexGuard<'_, Vec<String>> {
        recover(self.journal.lock())
    }

    fn lock_canned(&self) -> MutexGuard<'_, VecDeque<Vec<Row>>> {
        recover(self.canned_rows.lock())
    }

    fn lock_failures(&self) -> MutexGuard<'_, HashSet<String>> {
        recover(self.failures.lock())
    }

    fn lock_inserted_id(&self) -> MutexGuard<'_, Option<SqlValue>> {
        recover(self.inserted_id.lock())
    }
}

fn recover<'a, T>(
    result: Result<MutexGuard<'a, T>, std::sync::PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    match result {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn render_params(params: &SqlParams) -> String {
    if params.is_empty() {
        return String::new();
    }
    match params {
        SqlParams::Positional(values) => {
            let rendered: Vec<String> = values.iter().map(ToString::to_string).collect();
            format!(" [{}]", rendered.join(","))
        }
        SqlParams::Named(values) => {
            let mut pairs: Vec<(&String, &SqlValue)> = values.iter().collect();
            pairs.sort_by_key(|(key, _)| key.clone());
            let rendered: Vec<String> =
                pairs.iter().map(|(key, value)| format!("{key}:{value}")).collect();
            format!(" {{{}}}", rendered.join(","))
        }
    }
}

struct MemoryConnection {
    id: u64,
    state: Arc<MemoryState>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_failure(&self, sql: &str) -> Result<(), SqlConduitError> {
        if self.state.has_failure(sql) {
            Err(SqlConduitError::ExecutionError(format!(
                "forced failure: {sql}"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    async fn exec(&self, sql: &str, params: &SqlParams) -> Result<ExecResult, SqlConduitError> {
        self.check_failure(sql)?;
        self.state
            .record(format!("exec#{}:{sql}{}", self.id, render_params(params)));
        Ok(self.state.exec_result())
    }

    async fn query(&self, sql: &str, params: &SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        self.check_failure(sql)?;
        self.state
            .record(format!("query#{}:{sql}{}", self.id, render_params(params)));
        Ok(self.state.next_rows())
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, SqlConduitError> {
        self.check_failure(sql)?;
        self.state.record(format!("prepare#{}:{sql}", self.id));
        Ok(Box::new(MemoryStatement {
            conn_id: self.id,
            sql: sql.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn cursor(
        &self,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Box<dyn DriverCursor>, SqlConduitError> {
        self.check_failure(sql)?;
        self.state
            .record(format!("cursor#{}:{sql}{}", self.id, render_params(params)));
        Ok(Box::new(MemoryCursor {
            conn_id: self.id,
            rows: self.state.next_rows().into(),
            state: self.state.clone(),
        }))
    }

    async fn script(&self, sql: &str) -> Result<(), SqlConduitError> {
        self.check_failure(sql)?;
        self.state.record(format!("script#{}:{sql}", self.id));
        Ok(())
    }

    async fn close(&self) -> Result<(), SqlConduitError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SqlConduitError::ConnectionError(format!(
                "connection #{} closed twice",
                self.id
            )));
        }
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.record(format!("close#{}", self.id));
        if self.state.has_failure("close") {
            return Err(SqlConduitError::ConnectionError(
                "forced failure: close".to_string(),
            ));
        }
        Ok(())
    }
}

struct MemoryStatement {
    conn_id: u64,
    sql: String,
    state: Arc<MemoryState>,
}

#[async_trait]
impl DriverStatement for MemoryStatement {
    async fn exec(&self, params: &SqlParams) -> Result<ExecResult, SqlConduitError> {
        if self.state.has_failure(&self.sql) {
            return Err(SqlConduitError::ExecutionError(format!(
                "forced failure: {}",
                self.sql
            )));
        }
        self.state.record(format!(
            "stmt-exec#{}:{}{}",
            self.conn_id,
            self.sql,
            render_params(params)
        ));
        Ok(self.state.exec_result())
    }

    async fn query(&self, params: &SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        self.state.record(format!(
            "stmt-query#{}:{}{}",
            self.conn_id,
            self.sql,
            render_params(params)
        ));
        Ok(self.state.next_rows())
    }

    async fn cursor(&self, params: &SqlParams) -> Result<Box<dyn DriverCursor>, SqlConduitError> {
        self.state.record(format!(
            "stmt-cursor#{}:{}{}",
            self.conn_id,
            self.sql,
            render_params(params)
        ));
        Ok(Box::new(MemoryCursor {
            conn_id: self.conn_id,
            rows: self.state.next_rows().into(),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), SqlConduitError> {
        self.state
            .record(format!("stmt-close#{}:{}", self.conn_id, self.sql));
        Ok(())
    }
}

struct MemoryCursor {
    conn_id: u64,
    rows: VecDeque<Row>,
    state: Arc<MemoryState>,
}

#[async_trait]
impl DriverCursor for MemoryCursor {
    async fn fetch(&mut self) -> Result<Option<Row>, SqlConduitError> {
        Ok(self.rows.pop_front())
    }

    async fn close(&mut self) -> Result<(), SqlConduitError> {
        self.rows.clear();
        self.state.record(format!("cursor-close#{}", self.conn_id));
        Ok(())
    }
}
