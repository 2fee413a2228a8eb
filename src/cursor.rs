//! Cursor handles and the cursor lifecycle tracker.
//!
//! A cursor is pull-based and finite: `fetch` yields rows until the driver
//! reports the end, at which point the cursor closes itself and gives its
//! resources back. `close` terminates early with the same guarantees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::sync::Mutex as AsyncMutex;

use crate::driver::DriverCursor;
use crate::error::SqlConduitError;
use crate::params::SqlParams;
use crate::pool::Pool;
use crate::results::Row;

/// Cleanup hook run exactly once when a tracked resource ends: deregisters it
/// from its provider and releases any checkout it owned.
pub(crate) type EndHook = Box<dyn FnOnce() + Send>;

/// An open cursor over one query's result rows.
///
/// Cloning yields another handle to the same cursor; handles are registered
/// with their provider for cascading close.
#[derive(Clone)]
pub struct Cursor {
    inner: Arc<CursorInner>,
}

struct CursorInner {
    driver: AsyncMutex<Option<Box<dyn DriverCursor>>>,
    end: Mutex<Option<EndHook>>,
}

impl Cursor {
    pub(crate) fn new(driver: Box<dyn DriverCursor>, end: EndHook) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                driver: AsyncMutex::new(Some(driver)),
                end: Mutex::new(Some(end)),
            }),
        }
    }

    /// Fetch the next row, or `None` once the sequence is exhausted.
    ///
    /// Reaching the end closes the cursor: its checkout is released and later
    /// calls fail with a closed-cursor error.
    ///
    /// # Errors
    /// Fails on a closed cursor, and propagates driver fetch errors (which
    /// leave the cursor open).
    pub async fn fetch(&self) -> Result<Option<Row>, SqlConduitError> {
        let mut guard = self.inner.driver.lock().await;
        let Some(driver) = guard.as_mut() else {
            return Err(SqlConduitError::Closed {
                target: "cursor",
                method: "fetch",
            });
        };
        match driver.fetch().await {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                *guard = None;
                drop(guard);
                self.run_end();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Terminate early. The underlying driver resource is released even when
    /// rows remain.
    ///
    /// # Errors
    /// Fails on an already-closed cursor, and propagates driver close errors.
    pub async fn close(&self) -> Result<(), SqlConduitError> {
        let taken = self.inner.driver.lock().await.take();
        let Some(mut driver) = taken else {
            return Err(SqlConduitError::Closed {
                target: "cursor",
                method: "close",
            });
        };
        let result = driver.close().await;
        self.run_end();
        result
    }

    /// Close unless something else already did; used by cascading close-all
    /// paths that race with auto-close on exhaustion.
    pub(crate) async fn close_if_open(&self) -> Result<(), SqlConduitError> {
        let taken = self.inner.driver.lock().await.take();
        let Some(mut driver) = taken else {
            return Ok(());
        };
        let result = driver.close().await;
        self.run_end();
        result
    }

    pub(crate) fn is_open(&self) -> bool {
        self.inner
            .driver
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }

    fn run_end(&self) {
        let hook = match self.inner.end.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Tracks cursors opened directly on the main connection; each one owns a
/// non-exclusive checkout for its lifetime.
#[derive(Clone)]
pub(crate) struct CursorProvider {
    inner: Arc<CursorProviderInner>,
}

struct CursorProviderInner {
    pool: Pool,
    items: Mutex<HashMap<u64, Cursor>>,
    next_id: AtomicU64,
}

impl CursorProvider {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            inner: Arc::new(CursorProviderInner {
                pool,
                items: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) async fn open(
        &self,
        sql: &str,
        params: &SqlParams,
    ) -> Result<Cursor, SqlConduitError> {
        let conn = self.inner.pool.grab(false).await?;
        let driver_cursor = match conn.driver().cursor(sql, params).await {
            Ok(cursor) => cursor,
            Err(err) => {
                self.inner.pool.release(conn);
                return Err(err);
            }
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let provider = Arc::downgrade(&self.inner);
        let pool = self.inner.pool.clone();
        let end: EndHook = Box::new(move || {
            if let Some(provider) = provider.upgrade() {
                lock_items_of(&provider).remove(&id);
            }
            pool.release(conn);
        });
        let cursor = Cursor::new(driver_cursor, end);
        self.lock_items().insert(id, cursor.clone());
        Ok(cursor)
    }

    /// Close every still-open cursor concurrently; the first driver error
    /// wins, but every cursor still gets its close attempt.
    pub(crate) async fn close_all(&self) -> Result<(), SqlConduitError> {
        let items: Vec<Cursor> = self.lock_items().values().cloned().collect();
        let results = join_all(items.iter().map(Cursor::close_if_open)).await;
        results.into_iter().find_map(Result::err).map_or(Ok(()), Err)
    }

    fn lock_items(&self) -> MutexGuard<'_, HashMap<u64, Cursor>> {
        lock_items_of(&self.inner)
    }
}

fn lock_items_of(inner: &CursorProviderInner) -> MutexGuard<'_, HashMap<u64, Cursor>> {
    match inner.items.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
