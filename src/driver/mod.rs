//! The driver capability boundary.
//!
//! Everything vendor-specific lives behind these traits: an adapter wraps one
//! SQL client library and hands the core asynchronous connections that know
//! how to exec, query, prepare, open cursors, run scripts and close. The core
//! never talks to a driver crate directly.

pub mod debug;

use async_trait::async_trait;

use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::results::{ExecResult, Row};

/// Script support reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScriptSupport {
    /// Scripts are not supported.
    #[default]
    No,
    /// Scripts run on any connection.
    Yes,
    /// Scripts need a connection of their own (the pool hands out an
    /// exclusive checkout for them, and transactions refuse them).
    SeparateConnection,
}

/// Capability flags reported by each adapter.
///
/// The facade consults these before dispatching, so an unsupported operation
/// fails with an explicit error instead of an opaque driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub named_parameters: bool,
    pub prepared_statements: bool,
    pub cursors: bool,
    pub script: ScriptSupport,
}

impl Capabilities {
    /// Everything enabled; handy for tests and full-featured adapters.
    #[must_use]
    pub fn all() -> Self {
        Self {
            named_parameters: true,
            prepared_statements: true,
            cursors: true,
            script: ScriptSupport::Yes,
        }
    }

    pub(crate) fn ensure_cursors(&self) -> Result<(), SqlConduitError> {
        if self.cursors {
            Ok(())
        } else {
            Err(SqlConduitError::Unsupported("Cursors"))
        }
    }

    pub(crate) fn ensure_prepared_statements(&self) -> Result<(), SqlConduitError> {
        if self.prepared_statements {
            Ok(())
        } else {
            Err(SqlConduitError::Unsupported("Prepared statements"))
        }
    }

    pub(crate) fn ensure_named_parameters(&self) -> Result<(), SqlConduitError> {
        if self.named_parameters {
            Ok(())
        } else {
            Err(SqlConduitError::Unsupported("Named parameters"))
        }
    }

    pub(crate) fn ensure_script(&self) -> Result<(), SqlConduitError> {
        if self.script == ScriptSupport::No {
            Err(SqlConduitError::Unsupported("Scripts"))
        } else {
            Ok(())
        }
    }

    /// Named parameter sets need the adapter to support them; positional sets
    /// always pass.
    pub(crate) fn ensure_params(&self, params: &SqlParams) -> Result<(), SqlConduitError> {
        if params.is_named() && !params.is_empty() {
            self.ensure_named_parameters()?;
        }
        Ok(())
    }
}

/// Factory for physical driver connections plus the adapter's transaction
/// vocabulary.
///
/// The default `begin`/`commit`/`rollback` hooks issue the plain SQL commands;
/// adapters with a native transaction API override them.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    /// Open one physical connection. Invoked by the pool when no idle
    /// connection exists.
    ///
    /// # Errors
    /// Propagates whatever the underlying client reports.
    async fn open(&self) -> Result<Box<dyn DriverConnection>, SqlConduitError>;

    fn capabilities(&self) -> Capabilities;

    async fn begin(&self, conn: &dyn DriverConnection) -> Result<(), SqlConduitError> {
        conn.exec("begin", &SqlParams::empty()).await.map(|_| ())
    }

    async fn commit(&self, conn: &dyn DriverConnection) -> Result<(), SqlConduitError> {
        conn.exec("commit", &SqlParams::empty()).await.map(|_| ())
    }

    async fn rollback(&self, conn: &dyn DriverConnection) -> Result<(), SqlConduitError> {
        conn.exec("rollback", &SqlParams::empty()).await.map(|_| ())
    }
}

/// One physical database connection.
///
/// Methods take `&self`: drivers manage their own interior mutability the way
/// async SQL clients usually do, which lets the pool share a non-exclusive
/// connection between concurrent callers.
#[async_trait]
pub trait DriverConnection: Send + Sync {
    async fn exec(&self, sql: &str, params: &SqlParams) -> Result<ExecResult, SqlConduitError>;

    async fn query(&self, sql: &str, params: &SqlParams) -> Result<Vec<Row>, SqlConduitError>;

    async fn prepare(&self, sql: &str) -> Result<Box<dyn DriverStatement>, SqlConduitError>;

    async fn cursor(
        &self,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Box<dyn DriverCursor>, SqlConduitError>;

    async fn script(&self, sql: &str) -> Result<(), SqlConduitError>;

    async fn close(&self) -> Result<(), SqlConduitError>;
}

/// A driver-level prepared statement.
#[async_trait]
pub trait DriverStatement: Send + Sync {
    async fn exec(&self, params: &SqlParams) -> Result<ExecResult, SqlConduitError>;

    async fn query(&self, params: &SqlParams) -> Result<Vec<Row>, SqlConduitError>;

    async fn cursor(&self, params: &SqlParams) -> Result<Box<dyn DriverCursor>, SqlConduitError>;

    async fn close(&self) -> Result<(), SqlConduitError>;
}

/// A driver-level cursor: pull-based, finite, not restartable.
#[async_trait]
pub trait DriverCursor: Send {
    /// Fetch the next row, or `None` at end of sequence.
    async fn fetch(&mut self) -> Result<Option<Row>, SqlConduitError>;

    /// Terminate early, releasing the underlying driver resource.
    async fn close(&mut self) -> Result<(), SqlConduitError>;
}
