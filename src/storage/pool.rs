//! Fixed-size pool of SQLite connections.
//!
//! The pool owns schema creation and hands out connections through
//! [`PooledConnection`], which returns its handle on drop (including during
//! unwinding), so a caller can never leak a slot.
//!
//! `close` is not terminal: the next `acquire` opens a fresh set of
//! connections. Only callers already blocked in `acquire` when the pool closes
//! see [`StoreError::PoolClosed`].

use rusqlite::{Connection, OpenFlags};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::error::{StoreError, StoreResult};

pub const DEFAULT_POOL_SIZE: usize = 5;

/// Writers wait this long on a locked database before SQLite reports BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Distinguishes the shared-cache databases backing `:memory:` pools.
static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS detections (
      id INTEGER PRIMARY KEY AUTOINCREMENT,
      camera_name TEXT NOT NULL,
      timestamp TEXT NOT NULL,
      frame_number INTEGER NOT NULL,
      video_timestamp REAL NOT NULL,
      detection_data TEXT NOT NULL,
      created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    );

    CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp);
    CREATE INDEX IF NOT EXISTS idx_detections_video_timestamp ON detections(video_timestamp);
    CREATE INDEX IF NOT EXISTS idx_detections_camera_name ON detections(camera_name);
"#;

pub struct ConnectionPool {
    db_path: String,
    /// What connections actually open; differs from `db_path` for `:memory:`.
    open_path: String,
    max_connections: usize,
    /// Serializes initialize/close so only one caller builds connections.
    init_lock: Mutex<()>,
    state: Mutex<PoolState>,
    available: Condvar,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Connection>,
    initialized: bool,
    /// Bumped on every close; stale handles returned afterwards are dropped.
    generation: u64,
    /// Open connections across all generations, idle or checked out.
    live: usize,
}

impl ConnectionPool {
    /// A pool over `db_path`. `:memory:` becomes one private in-memory
    /// database shared by every connection of this pool.
    pub fn new(db_path: impl Into<String>, max_connections: usize) -> Self {
        let db_path = db_path.into();
        let open_path = if db_path == ":memory:" {
            format!(
                "file:posewatch-mem-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            db_path.clone()
        };
        Self {
            db_path,
            open_path,
            max_connections: max_connections.max(1),
            init_lock: Mutex::new(()),
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Open `max_connections` connections and create the schema.
    ///
    /// Idempotent: concurrent callers serialize on the init lock and all but
    /// the first observe the initialized pool and return. On failure every
    /// connection opened so far is closed before the error propagates.
    pub fn initialize(&self) -> StoreResult<()> {
        let _init = lock(&self.init_lock);
        if self.lock_state().initialized {
            return Ok(());
        }

        ensure_parent_dir(&self.db_path);
        let mut opened = VecDeque::with_capacity(self.max_connections);
        for index in 0..self.max_connections {
            match self.open_connection() {
                Ok(conn) => opened.push_back(conn),
                Err(err) => {
                    for conn in opened.drain(..) {
                        close_quietly(conn);
                    }
                    log::error!(
                        "ConnectionPool: failed to open {} ({} of {}): {}",
                        self.db_path,
                        index + 1,
                        self.max_connections,
                        err
                    );
                    return Err(err);
                }
            }
        }

        let mut state = self.lock_state();
        // Stale handles from before the last close may still be checked out.
        state.live += opened.len();
        state.idle = opened;
        state.initialized = true;
        drop(state);
        self.available.notify_all();

        log::info!(
            "ConnectionPool: initialized {} connections to {}",
            self.max_connections,
            self.db_path
        );
        Ok(())
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let conn = open_db_connection(&self.open_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL: readers proceed concurrently, writers are serialized by SQLite.
        // In-memory databases report "memory" and keep their own journal.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Check out a connection, waiting until one is returned if all are busy.
    ///
    /// Initializes the pool on first use and again after a `close`. A caller
    /// waiting here when the pool closes gets [`StoreError::PoolClosed`].
    pub fn acquire(&self) -> StoreResult<PooledConnection<'_>> {
        self.acquire_inner(None)
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> StoreResult<PooledConnection<'_>> {
        self.acquire_inner(Some(Instant::now() + timeout))
    }

    fn acquire_inner(&self, deadline: Option<Instant>) -> StoreResult<PooledConnection<'_>> {
        self.initialize()?;
        let mut state = self.lock_state();
        loop {
            if !state.initialized {
                return Err(StoreError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop_front() {
                return Ok(PooledConnection {
                    pool: self,
                    conn: Some(conn),
                    generation: state.generation,
                });
            }
            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(StoreError::AcquireTimeout);
                    }
                    self.available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }

    /// Run `work` with a pooled connection; the connection is returned on
    /// every exit path.
    pub fn with_connection<T, E>(
        &self,
        work: impl FnOnce(&mut Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut conn = self.acquire().map_err(E::from)?;
        work(&mut *conn)
    }

    fn release(&self, conn: Connection, generation: u64) {
        let mut state = self.lock_state();
        if state.initialized && state.generation == generation {
            state.idle.push_back(conn);
            drop(state);
            self.available.notify_one();
        } else {
            state.live = state.live.saturating_sub(1);
            drop(state);
            close_quietly(conn);
        }
    }

    /// Close every idle connection and mark the pool uninitialized.
    ///
    /// Connections still checked out are closed when their guard drops. The
    /// pool can be initialized again afterwards.
    pub fn close(&self) {
        let _init = lock(&self.init_lock);
        let drained: Vec<Connection> = {
            let mut state = self.lock_state();
            if !state.initialized {
                return;
            }
            state.initialized = false;
            state.generation += 1;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            drained
        };
        self.available.notify_all();
        let count = drained.len();
        for conn in drained {
            close_quietly(conn);
        }
        log::info!("ConnectionPool: closed {} idle connections", count);
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().initialized
    }

    /// Connections currently waiting in the pool.
    pub fn idle_count(&self) -> usize {
        self.lock_state().idle.len()
    }

    /// Physical connections opened by the pool and not yet closed.
    pub fn live_connections(&self) -> usize {
        self.lock_state().live
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

/// A checked-out connection. Returns itself to the pool when dropped.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    conn: Option<Connection>,
    generation: u64,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
            .as_mut()
            .unwrap_or_else(|| unreachable!("pooled connection used after release"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation);
        }
    }
}

/// Open a connection, honouring `file:` URIs (shared in-memory databases).
pub(crate) fn open_db_connection(db_path: &str) -> rusqlite::Result<Connection> {
    if db_path.starts_with("file:") {
        return Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
    }
    Connection::open(db_path)
}

fn ensure_parent_dir(db_path: &str) {
    if db_path.starts_with("file:") || db_path == ":memory:" {
        return;
    }
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                log::warn!(
                    "ConnectionPool: could not create {}: {}",
                    parent.display(),
                    err
                );
            }
        }
    }
}

fn close_quietly(conn: Connection) {
    if let Err((_, err)) = conn.close() {
        log::warn!("ConnectionPool: error closing connection: {}", err);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn temp_pool(size: usize) -> (tempfile::TempDir, ConnectionPool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pool.db");
        let pool = ConnectionPool::new(path.to_string_lossy().to_string(), size);
        (dir, pool)
    }

    #[test]
    fn initialize_is_idempotent() {
        let (_dir, pool) = temp_pool(3);
        pool.initialize().unwrap();
        pool.initialize().unwrap();
        assert_eq!(pool.live_connections(), 3);
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn concurrent_initialize_opens_exactly_max_connections() {
        let (_dir, pool) = temp_pool(4);
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.initialize())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(pool.live_connections(), 4);
        assert_eq!(pool.idle_count(), 4);
    }

    #[test]
    fn connection_returns_after_failed_work() {
        let (_dir, pool) = temp_pool(2);
        let result: Result<(), StoreError> = pool.with_connection(|conn| {
            conn.execute("INSERT INTO no_such_table VALUES (1)", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn connection_returns_after_panic() {
        let (_dir, pool) = temp_pool(2);
        pool.initialize().unwrap();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _conn = pool.acquire().unwrap();
            panic!("injected failure");
        }));
        assert!(outcome.is_err());
        assert_eq!(pool.idle_count(), 2);
    }

    #[test]
    fn acquire_times_out_when_exhausted() {
        let (_dir, pool) = temp_pool(1);
        let held = pool.acquire().unwrap();
        let err = pool
            .acquire_timeout(Duration::from_millis(20))
            .err()
            .expect("pool should be exhausted");
        assert!(matches!(err, StoreError::AcquireTimeout));
        drop(held);
        assert!(pool.acquire_timeout(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn blocked_acquire_wakes_on_release() {
        let (_dir, pool) = temp_pool(1);
        let pool = Arc::new(pool);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(30));
        drop(held);
        waiter.join().unwrap().unwrap();
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn close_then_reinitialize() {
        let (_dir, pool) = temp_pool(2);
        pool.initialize().unwrap();
        let held = pool.acquire().unwrap();
        pool.close();
        assert!(!pool.is_initialized());
        assert_eq!(pool.idle_count(), 0);
        drop(held);
        assert_eq!(pool.live_connections(), 0);

        pool.initialize().unwrap();
        assert_eq!(pool.live_connections(), 2);
    }

    #[test]
    fn stale_connection_returned_after_reinitialize() {
        let (_dir, pool) = temp_pool(2);
        let held = pool.acquire().unwrap();
        pool.close();
        pool.initialize().unwrap();
        assert_eq!(pool.live_connections(), 3);

        drop(held);
        assert_eq!(pool.live_connections(), 2);
        assert_eq!(pool.idle_count(), 2);

        pool.close();
        assert_eq!(pool.live_connections(), 0);
    }

    #[test]
    fn blocked_acquire_fails_when_pool_closes() {
        let (_dir, pool) = temp_pool(1);
        let pool = Arc::new(pool);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.close();
        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(StoreError::PoolClosed)));
        drop(held);
        assert_eq!(pool.live_connections(), 0);
    }

    #[test]
    fn acquire_after_close_reopens() {
        let (_dir, pool) = temp_pool(2);
        pool.initialize().unwrap();
        pool.close();
        let conn = pool.acquire().unwrap();
        assert!(pool.is_initialized());
        drop(conn);
        assert_eq!(pool.live_connections(), 2);
    }

    #[test]
    fn memory_pool_shares_one_database() {
        let pool = ConnectionPool::new(":memory:", 2);
        assert_eq!(pool.db_path(), ":memory:");
        let writer = pool.acquire().unwrap();
        let reader = pool.acquire().unwrap();
        writer
            .execute(
                "INSERT INTO detections (camera_name, timestamp, frame_number, video_timestamp, detection_data)
                 VALUES ('cam', '2026-01-01T00:00:00.000000Z', 1, 0.0, '[]')",
                [],
            )
            .unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn memory_pools_are_isolated() {
        let first = ConnectionPool::new(":memory:", 1);
        let second = ConnectionPool::new(":memory:", 1);
        first
            .acquire()
            .unwrap()
            .execute(
                "INSERT INTO detections (camera_name, timestamp, frame_number, video_timestamp, detection_data)
                 VALUES ('cam', '2026-01-01T00:00:00.000000Z', 1, 0.0, '[]')",
                [],
            )
            .unwrap();
        let count: i64 = second
            .acquire()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn failed_initialize_leaves_no_connections() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let pool = ConnectionPool::new(dir.path().to_string_lossy().to_string(), 3);
        assert!(pool.initialize().is_err());
        assert!(!pool.is_initialized());
        assert_eq!(pool.live_connections(), 0);
    }
}
