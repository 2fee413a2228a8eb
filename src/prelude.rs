//! Convenient imports for common functionality.
//!
//! This module re-exports the most commonly used types and functions
//! to make it easier to get started with the library.

pub use crate::connection::{ConduitOptions, Connection};
pub use crate::cursor::Cursor;
pub use crate::driver::{
    Capabilities, DriverAdapter, DriverConnection, DriverCursor, DriverStatement, ScriptSupport,
};
pub use crate::error::SqlConduitError;
pub use crate::params::{merge_params, SqlParams};
pub use crate::pool::{PoolEvent, PoolEventKind, PoolOptions, PoolStats};
pub use crate::results::{to_single_row, to_single_value, ExecResult, Row};
pub use crate::statement::PreparedStatement;
pub use crate::transaction::Transaction;
pub use crate::types::SqlValue;
