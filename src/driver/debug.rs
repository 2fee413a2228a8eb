//! Debug decorator around a driver connection.
//!
//! Intercepts each of the fixed driver operations and forwards to `tracing`
//! as a structured event sink, tagged with the connection's pool id. Enabled
//! per pool via [`crate::connection::ConduitOptions::debug_log`].

use async_trait::async_trait;

use crate::driver::{DriverConnection, DriverCursor, DriverStatement};
use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::results::{ExecResult, Row};

const TARGET: &str = "sql_conduit::driver";

pub struct DebugConnection {
    id: u64,
    inner: Box<dyn DriverConnection>,
}

impl DebugConnection {
    #[must_use]
    pub fn new(id: u64, inner: Box<dyn DriverConnection>) -> Self {
        Self { id, inner }
    }
}

#[async_trait]
impl DriverConnection for DebugConnection {
    async fn exec(&self, sql: &str, params: &SqlParams) -> Result<ExecResult, SqlConduitError> {
        let result = self.inner.exec(sql, params).await;
        match &result {
            Ok(res) => tracing::debug!(
                target: TARGET,
                connection_id = self.id,
                sql,
                params = params.len(),
                affected_rows = res.affected_rows,
                "exec"
            ),
            Err(error) => tracing::debug!(
                target: TARGET,
                connection_id = self.id,
                sql,
                %error,
                "exec failed"
            ),
        }
        result
    }

    async fn query(&self, sql: &str, params: &SqlParams) -> Result<Vec<Row>, SqlConduitError> {
        let result = self.inner.query(sql, params).await;
        match &result {
            Ok(rows) => tracing::debug!(
                target: TARGET,
                connection_id = self.id,
                sql,
                params = params.len(),
                rows = rows.len(),
                "query"
            ),
            Err(error) => tracing::debug!(
                target: TARGET,
                connection_id = self.id,
                sql,
                %error,
                "query failed"
            ),
        }
        result
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, SqlConduitError> {
        let result = self.inner.prepare(sql).await;
        tracing::debug!(
            target: TARGET,
            connection_id = self.id,
            sql,
            ok = result.is_ok(),
            "prepare"
        );
        result
    }

    async fn cursor(
        &self,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Box<dyn DriverCursor>, SqlConduitError> {
        let result = self.inner.cursor(sql, params).await;
        tracing::debug!(
            target: TARGET,
            connection_id = self.id,
            sql,
            params = params.len(),
            ok = result.is_ok(),
            "cursor"
        );
        result
    }

    async fn script(&self, sql: &str) -> Result<(), SqlConduitError> {
        let result = self.inner.script(sql).await;
        tracing::debug!(
            target: TARGET,
            connection_id = self.id,
            sql,
            ok = result.is_ok(),
            "script"
        );
        result
    }

    async fn close(&self) -> Result<(), SqlConduitError> {
        let result = self.inner.close().await;
        tracing::debug!(
            target: TARGET,
            connection_id = self.id,
            ok = result.is_ok(),
            "close"
        );
        result
    }
}
