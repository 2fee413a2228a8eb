use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::driver::DriverConnection;
use crate::error::SqlConduitError;

/// A driver connection checked out of (or parked in) the pool.
///
/// Carries an opaque monotonic id assigned when the connection was opened;
/// the id shows up in monitoring events and debug logs and identifies the
/// connection inside the pool. Cloning is cheap and does not duplicate the
/// physical connection.
#[derive(Clone)]
pub struct PooledConnection {
    pub(crate) id: u64,
    pub(crate) driver: Arc<dyn DriverConnection>,
}

impl PooledConnection {
    /// The pool-assigned connection id (diagnostics only).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying driver connection.
    #[must_use]
    pub fn driver(&self) -> &dyn DriverConnection {
        &*self.driver
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// One idle pool entry: the connection plus the moment it was released.
#[derive(Debug)]
pub(crate) struct PoolItem {
    pub(crate) connection: PooledConnection,
    pub(crate) release_time: Instant,
}

impl PoolItem {
    pub(crate) fn new(connection: PooledConnection) -> Self {
        Self {
            connection,
            release_time: Instant::now(),
        }
    }
}

/// What happened to a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEventKind {
    Open,
    Grab,
    Release,
    Abandon,
    Close,
}

/// Monitoring event emitted on every pool state change.
#[derive(Debug, Clone, Copy)]
pub struct PoolEvent {
    pub kind: PoolEventKind,
    pub connection_id: u64,
}

/// Callback invoked for every [`PoolEvent`].
pub type MonitorCallback = Arc<dyn Fn(PoolEvent) + Send + Sync>;

/// Callback receiving errors nobody is waiting on (idle-reaper and abandon
/// closes). Defaults to a `tracing::error!` sink.
pub type ErrorLogCallback = Arc<dyn Fn(&SqlConduitError) + Send + Sync>;

/// Pool tuning knobs.
#[derive(Clone, Default)]
pub struct PoolOptions {
    /// How long a released connection may sit idle before the reaper closes
    /// it. `None` means the 60 second default.
    pub connection_ttl: Option<Duration>,
    /// Keep the last idle connection alive past its TTL while no shared
    /// non-exclusive connection is active, avoiding cold-open latency on
    /// bursty workloads.
    pub keep_one_connection: bool,
    /// Monitoring callback for open/grab/release/abandon/close events.
    pub monitor: Option<MonitorCallback>,
    /// Sink for pool-internal close errors.
    pub log_error: Option<ErrorLogCallback>,
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("connection_ttl", &self.connection_ttl)
            .field("keep_one_connection", &self.keep_one_connection)
            .field("monitor", &self.monitor.is_some())
            .field("log_error", &self.log_error.is_some())
            .finish()
    }
}

/// Snapshot of the pool's bookkeeping, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked in the idle stack.
    pub idle: usize,
    /// Concurrent holders of the shared non-exclusive connection.
    pub non_exclusive_holders: usize,
    pub closed: bool,
}
