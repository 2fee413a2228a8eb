use thiserror::Error;

/// Crate-wide error type.
///
/// Usage errors (closed handles, capability mismatches, cardinality and
/// parameter-kind violations) get their own variants so callers can match on
/// them; driver failures are carried opaquely in [`SqlConduitError::Driver`].
#[derive(Debug, Error)]
pub enum SqlConduitError {
    #[error("Invalid call to '{method}', the {target} is closed")]
    Closed {
        target: &'static str,
        method: &'static str,
    },

    #[error("Invalid call to '{0}', not in a transaction")]
    NotInTransaction(&'static str),

    #[error("{0} are not available with this adapter")]
    Unsupported(&'static str),

    #[error("Scripts are available only on the main connection with this adapter")]
    ScriptOnMainConnectionOnly,

    #[error("Only one cursor is allowed by the underlying connection")]
    CursorExclusivity,

    #[error("Cannot fetch one row, row count: {0}")]
    RowCardinality(usize),

    #[error("Cannot fetch one value, column count: {0}")]
    ValueCardinality(usize),

    #[error("Missing inserted ID")]
    MissingInsertedId,

    #[error("Parameter error: {0}")]
    ParameterError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Driver error: {0}")]
    Driver(Box<dyn std::error::Error + Send + Sync>),
}

impl SqlConduitError {
    /// Wrap an adapter-level error without losing it.
    pub fn driver(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SqlConduitError::Driver(err.into())
    }
}
