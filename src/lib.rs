//! Async database-access layer with transaction-aware pooling.
//!
//! The crate fronts any driver implementing [`driver::DriverAdapter`] with a
//! single [`Connection`] facade. Simple operations share one non-exclusive
//! physical connection; transactions each hold an exclusive one. Prepared
//! statements, cursors and transactions are tracked so closing the facade
//! cascades through everything still open, and an idle reaper retires pooled
//! connections past their TTL.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sql_conduit::prelude::*;
//!
//! async fn demo(adapter: Arc<dyn DriverAdapter>) -> Result<(), SqlConduitError> {
//!     let db = Connection::open(adapter, ConduitOptions::default());
//!     db.exec(
//!         "insert into t (a) values (?)",
//!         SqlParams::from(vec![SqlValue::Int(1)]),
//!     )
//!     .await?;
//!     let tx = db.begin_transaction().await?;
//!     tx.exec("update t set a = a + 1", SqlParams::empty()).await?;
//!     tx.commit().await?;
//!     db.close().await
//! }
//! ```

pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod params;
pub mod pool;
pub mod prelude;
pub mod results;
pub mod statement;
pub mod transaction;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use connection::{ConduitOptions, Connection};
pub use cursor::Cursor;
pub use error::SqlConduitError;
pub use params::{merge_params, SqlParams};
pub use results::{ExecResult, Row};
pub use statement::PreparedStatement;
pub use transaction::Transaction;
pub use types::SqlValue;
