//! SQLite Connection Pool
//!
//! Fixed set of connections handed out one per unit of work. A checkout
//! waits at most `checkout_timeout` for a free connection; the connection
//! goes back to the pool when the work finishes, whether it succeeded,
//! failed or panicked.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::application::ports::StorageError;

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
PRAGMA temp_store = MEMORY;
";

/// Pool of SQLite connections to one database file.
#[derive(Debug)]
pub struct ConnectionPool {
    path: PathBuf,
    idle: Arc<Mutex<Vec<Connection>>>,
    permits: Arc<Semaphore>,
    checkout_timeout: Duration,
}

/// A checked-out connection. Returned to the pool on drop, before the
/// permit is released.
struct Lease {
    connection: Option<Connection>,
    idle: Arc<Mutex<Vec<Connection>>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.idle.lock().push(connection);
        }
    }
}

impl ConnectionPool {
    /// Open `size` connections to `path`, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unavailable`] if a connection cannot be
    /// opened or configured.
    pub fn open(
        path: &Path,
        size: usize,
        busy_timeout: Duration,
        checkout_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let size = size.max(1);
        let mut connections = Vec::with_capacity(size);
        for _ in 0..size {
            connections.push(open_connection(path, busy_timeout)?);
        }

        if let Some(first) = connections.first() {
            let journal_mode: String = first
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(|e| unavailable("read journal mode", e))?;
            if !journal_mode.eq_ignore_ascii_case("wal") {
                warn!(journal_mode, "WAL mode not active");
            }
        }

        debug!(path = %path.display(), size, "Connection pool opened");
        Ok(Self {
            path: path.to_path_buf(),
            idle: Arc::new(Mutex::new(connections)),
            permits: Arc::new(Semaphore::new(size)),
            checkout_timeout,
        })
    }

    /// Database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Connections currently idle.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Run `work` on a pooled connection on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Timeout`] if no connection frees up within
    /// the checkout timeout, or whatever `work` returns.
    pub async fn run<T, F>(&self, operation: &str, work: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let permit = tokio::time::timeout(
            self.checkout_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::Timeout {
            operation: format!("{operation}: connection checkout"),
        })?
        .map_err(|_| StorageError::unavailable("connection pool closed"))?;

        let connection = self
            .idle
            .lock()
            .pop()
            .ok_or_else(|| StorageError::unavailable("connection pool exhausted"))?;
        let mut lease = Lease {
            connection: Some(connection),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        };

        tokio::task::spawn_blocking(move || match lease.connection.as_mut() {
            Some(connection) => work(connection),
            None => Err(StorageError::unavailable("connection lease is empty")),
        })
        .await
        .map_err(|e| StorageError::Unavailable {
            message: format!("{operation}: storage task failed"),
            source: Some(Box::new(e)),
        })?
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StorageError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let connection =
        Connection::open_with_flags(path, flags).map_err(|e| unavailable("open database", e))?;
    connection
        .busy_timeout(busy_timeout)
        .map_err(|e| unavailable("set busy timeout", e))?;
    connection
        .execute_batch(PRAGMAS)
        .map_err(|e| unavailable("apply pragmas", e))?;
    Ok(connection)
}

fn unavailable(message: &str, source: rusqlite::Error) -> StorageError {
    StorageError::Unavailable {
        message: message.to_string(),
        source: Some(Box::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize, checkout: Duration) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::open(
            &dir.path().join("pool.db"),
            size,
            Duration::from_millis(500),
            checkout,
        )
        .unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn connection_returns_after_error() {
        let (_dir, pool) = pool(1, Duration::from_secs(1));

        let err = pool
            .run("failing", |_| Err::<(), _>(StorageError::unavailable("boom")))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));
        assert_eq!(pool.idle(), 1);

        let value = pool
            .run("select", |conn| {
                conn.query_row("SELECT 7", [], |row| row.get::<_, i64>(0))
                    .map_err(|e| unavailable("select", e))
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn checkout_times_out_when_exhausted() {
        let (_dir, pool) = pool(1, Duration::from_millis(20));
        let pool = Arc::new(pool);

        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.run("hold", move |_| {
                    let _ = release_rx.recv();
                    Ok(())
                })
                .await
            })
        };
        while pool.idle() == 1 {
            tokio::task::yield_now().await;
        }

        let err = pool.run("wait", |_| Ok(())).await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout { .. }));

        release_tx.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn foreign_keys_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_connection(&dir.path().join("fk.db"), Duration::from_millis(100)).unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
