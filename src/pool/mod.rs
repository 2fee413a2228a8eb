//! The connection pool.
//!
//! Connections are handed out two ways: non-exclusive checkouts share one
//! physical connection (ref-counted), trading query parallelism for
//! connection-count economy, while exclusive checkouts get a connection of
//! their own so concurrent transactions never interleave. Released
//! connections park in a LIFO stack and an idle reaper closes the ones that
//! outlive their TTL.
//!
//! Invariant: a connection is in exactly one of {checked out exclusively,
//! checked out non-exclusively (possibly shared), idle, discarded}.

mod types;

pub use types::{
    ErrorLogCallback, MonitorCallback, PoolEvent, PoolEventKind, PoolOptions, PoolStats,
    PooledConnection,
};
pub(crate) use types::PoolItem;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::time::Instant;

use futures_util::future::join_all;

use crate::driver::debug::DebugConnection;
use crate::driver::{DriverAdapter, DriverConnection};
use crate::error::SqlConduitError;

const DEFAULT_CONNECTION_TTL: Duration = Duration::from_secs(60);
const REAPER_PERIOD: Duration = Duration::from_secs(1);
const REAPER_IDLE_SWEEPS: u32 = 10;

/// Transaction-aware connection pool over one driver adapter.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    adapter: Arc<dyn DriverAdapter>,
    connection_ttl: Duration,
    keep_one_connection: bool,
    debug_log: bool,
    monitor: Option<MonitorCallback>,
    log_error: ErrorLogCallback,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

struct PoolState {
    available: Vec<PoolItem>,
    non_exclusive: Option<PooledConnection>,
    non_exclusive_count: usize,
    closed: bool,
    reaper_active: bool,
}

impl Pool {
    #[must_use]
    pub fn new(adapter: Arc<dyn DriverAdapter>, options: PoolOptions, debug_log: bool) -> Self {
        let log_error = options.log_error.unwrap_or_else(|| {
            Arc::new(|err: &SqlConduitError| {
                tracing::error!(target: "sql_conduit::pool", error = %err, "connection close failed");
            })
        });
        Self {
            inner: Arc::new(PoolInner {
                adapter,
                connection_ttl: options.connection_ttl.unwrap_or(DEFAULT_CONNECTION_TTL),
                keep_one_connection: options.keep_one_connection,
                debug_log,
                monitor: options.monitor,
                log_error,
                next_id: AtomicU64::new(0),
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    non_exclusive: None,
                    non_exclusive_count: 0,
                    closed: false,
                    reaper_active: false,
                }),
            }),
        }
    }

    /// Check a connection out of the pool.
    ///
    /// Non-exclusive grabs join the shared connection when one is active;
    /// otherwise the most-recently-released idle connection is reused, or a
    /// fresh one is opened through the adapter. Exclusive grabs never return
    /// the shared connection.
    ///
    /// # Errors
    /// Fails with a closed-pool usage error once [`Pool::close`] has run, and
    /// propagates adapter open failures.
    pub async fn grab(&self, exclusive: bool) -> Result<PooledConnection, SqlConduitError> {
        {
            let mut state = self.lock_state();
            if state.closed {
                return Err(SqlConduitError::Closed {
                    target: "pool",
                    method: "grab",
                });
            }
            if !exclusive {
                if let Some(shared) = state.non_exclusive.clone() {
                    state.non_exclusive_count += 1;
                    drop(state);
                    self.monitor(PoolEventKind::Grab, shared.id);
                    return Ok(shared);
                }
            }
            if let Some(item) = state.available.pop() {
                let conn = item.connection;
                if !exclusive {
                    state.non_exclusive = Some(conn.clone());
                    state.non_exclusive_count = 1;
                }
                drop(state);
                self.monitor(PoolEventKind::Grab, conn.id);
                return Ok(conn);
            }
        }

        // Nothing idle; open outside the lock.
        let driver = self.inner.adapter.open().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let driver: Arc<dyn DriverConnection> = if self.inner.debug_log {
            Arc::new(DebugConnection::new(id, driver))
        } else {
            Arc::from(driver)
        };
        let conn = PooledConnection { id, driver };
        self.monitor(PoolEventKind::Open, conn.id);

        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            self.discard(conn);
            return Err(SqlConduitError::Closed {
                target: "pool",
                method: "grab",
            });
        }
        if !exclusive {
            if let Some(shared) = state.non_exclusive.clone() {
                // Another task installed a shared connection while we were
                // opening; park ours and join theirs.
                state.non_exclusive_count += 1;
                state.available.push(PoolItem::new(conn));
                drop(state);
                self.monitor(PoolEventKind::Grab, shared.id);
                return Ok(shared);
            }
            state.non_exclusive = Some(conn.clone());
            state.non_exclusive_count = 1;
        }
        drop(state);
        self.monitor(PoolEventKind::Grab, conn.id);
        Ok(conn)
    }

    /// Return a checkout to the pool.
    ///
    /// For the shared non-exclusive connection this decrements the ref-count
    /// and only parks the connection once the count reaches zero; exclusive
    /// checkouts park immediately.
    pub fn release(&self, conn: PooledConnection) {
        self.monitor(PoolEventKind::Release, conn.id);
        let mut state = self.lock_state();
        let is_shared = state
            .non_exclusive
            .as_ref()
            .is_some_and(|shared| shared.id == conn.id);
        if is_shared {
            state.non_exclusive_count = state.non_exclusive_count.saturating_sub(1);
            if state.non_exclusive_count == 0 {
                state.non_exclusive = None;
                state.available.push(PoolItem::new(conn));
            }
        } else {
            state.available.push(PoolItem::new(conn));
        }
        if state.closed {
            self.sweep(&mut state, true);
        } else {
            self.ensure_reaper(&mut state);
        }
    }

    /// Discard a checkout whose connection is no longer trustworthy (failed
    /// commit or rollback). The connection is closed, never re-pooled, and
    /// close errors go to the error-log callback rather than any caller.
    pub fn abandon(&self, conn: PooledConnection) {
        self.monitor(PoolEventKind::Abandon, conn.id);
        {
            let mut state = self.lock_state();
            let is_shared = state
                .non_exclusive
                .as_ref()
                .is_some_and(|shared| shared.id == conn.id);
            if is_shared {
                state.non_exclusive_count = state.non_exclusive_count.saturating_sub(1);
                state.non_exclusive = None;
            }
        }
        self.spawn_close(conn);
    }

    /// Close the pool. Terminal: all idle connections are closed concurrently
    /// and every later `grab` fails.
    ///
    /// # Errors
    /// Fails with a closed-pool usage error when called twice, and propagates
    /// the first driver close error.
    pub async fn close(&self) -> Result<(), SqlConduitError> {
        let drained = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(SqlConduitError::Closed {
                    target: "pool",
                    method: "close",
                });
            }
            state.closed = true;
            std::mem::take(&mut state.available)
        };
        let results = join_all(drained.into_iter().map(|item| {
            self.monitor(PoolEventKind::Close, item.connection.id);
            let driver = item.connection.driver;
            async move { driver.close().await }
        }))
        .await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    /// Bookkeeping snapshot.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            idle: state.available.len(),
            non_exclusive_holders: state.non_exclusive_count,
            closed: state.closed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn monitor(&self, kind: PoolEventKind, connection_id: u64) {
        if let Some(monitor) = &self.inner.monitor {
            monitor(PoolEvent {
                kind,
                connection_id,
            });
        }
    }

    /// Close idle connections older than the TTL, oldest first. With `force`,
    /// everything goes regardless of age or the keep-one rule.
    fn sweep(&self, state: &mut PoolState, force: bool) {
        let cutoff = Instant::now().checked_sub(self.inner.connection_ttl);
        let len = state.available.len();
        let mut expired = 0;
        for index in 0..len {
            if !force {
                let fresh = cutoff.is_none_or(|cutoff| state.available[index].release_time > cutoff);
                let keep_this_one = self.inner.keep_one_connection
                    && state.non_exclusive.is_none()
                    && index == len - 1;
                if fresh || keep_this_one {
                    break;
                }
            }
            expired += 1;
        }
        for item in state.available.drain(..expired) {
            self.monitor(PoolEventKind::Close, item.connection.id);
            self.spawn_close(item.connection);
        }
    }

    fn discard(&self, conn: PooledConnection) {
        self.monitor(PoolEventKind::Close, conn.id);
        self.spawn_close(conn);
    }

    fn spawn_close(&self, conn: PooledConnection) {
        let log_error = self.inner.log_error.clone();
        tokio::spawn(async move {
            if let Err(err) = conn.driver.close().await {
                log_error(&err);
            }
        });
    }

    fn ensure_reaper(&self, state: &mut PoolState) {
        if !state.reaper_active {
            state.reaper_active = true;
            spawn_reaper(Arc::downgrade(&self.inner));
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("Pool").field("stats", &stats).finish()
    }
}

/// Periodic idle reaper. Holds only a weak handle so an abandoned pool can be
/// dropped; stops itself after ten consecutive sweeps that found the idle
/// stack empty (the next release restarts it).
fn spawn_reaper(weak: Weak<PoolInner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAPER_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut empty_sweeps = 0u32;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let pool = Pool { inner };
            let stop = {
                let mut state = pool.lock_state();
                if state.closed {
                    state.reaper_active = false;
                    true
                } else {
                    pool.sweep(&mut state, false);
                    if state.available.is_empty() {
                        empty_sweeps += 1;
                    } else {
                        empty_sweeps = 0;
                    }
                    if empty_sweeps >= REAPER_IDLE_SWEEPS {
                        state.reaper_active = false;
                        true
                    } else {
                        false
                    }
                }
            };
            if stop {
                break;
            }
        }
    });
}
