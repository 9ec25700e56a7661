//! Pooled SQLite backing store.
//!
//! The store hands out three kinds of handles:
//! - [`Database::read`]: a `query_only` session,
//! - [`Database::write`]: a writable session outside any transaction,
//! - [`Database::transaction`]: a `BEGIN IMMEDIATE` transaction that rolls
//!   back unless [`Transaction::commit`] is called.
//!
//! Writers are serialized by an async gate so that SQLite's single-writer
//! lock is never contended from inside the runtime. Every handle returns its
//! connection to the pool exactly once, when dropped.

mod schema;

use crate::error::{Error, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub use rusqlite::{params, Row, ToSql};

/// Smallest pool size. A transaction holds one connection while key lookups
/// may need another.
pub const MIN_CONNECTIONS: usize = 2;

/// Backing store configuration.
///
/// SQLite `:memory:` databases are per-connection and therefore unsupported;
/// point `path` at a file (tests use a temporary directory).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    path: PathBuf,
    max_connections: usize,
    busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Creates a configuration for the database file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Sets the pool size (at least [`MIN_CONNECTIONS`]).
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Sets how long SQLite waits on a locked database.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the effective pool size.
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections.max(MIN_CONNECTIONS)
    }

    /// Returns the busy timeout.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: PathBuf::from("kasadb.sqlite3"), max_connections: 4, busy_timeout_ms: 5_000 }
    }
}

struct Pool {
    config: DatabaseConfig,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    writer: Arc<AsyncMutex<()>>,
}

impl Pool {
    fn release(&self, conn: Connection) {
        if conn.is_autocommit() {
            self.idle.lock().push(conn);
        } else {
            warn!("discarding pooled connection left inside a transaction");
        }
    }
}

/// Handle to the pooled backing store. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool>,
}

impl Database {
    /// Opens (creating if needed) the database and its schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        let conn = open_connection(&config)?;
        schema::ensure_schema(&conn)?;
        debug!(path = %config.path().display(), "database opened");

        let permits = Arc::new(Semaphore::new(config.max_connections()));
        let pool = Pool {
            config,
            idle: Mutex::new(vec![conn]),
            permits,
            writer: Arc::new(AsyncMutex::new(())),
        };
        Ok(Self { pool: Arc::new(pool) })
    }

    /// Acquires a read-only session.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be opened.
    pub async fn read(&self) -> Result<Session> {
        self.acquire(true, None).await
    }

    /// Acquires a writable session, waiting for any other writer to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be opened.
    pub async fn write(&self) -> Result<Session> {
        let writer = Arc::clone(&self.pool.writer).lock_owned().await;
        self.acquire(false, Some(writer)).await
    }

    /// Begins a write transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be opened or `BEGIN` fails.
    pub async fn transaction(&self) -> Result<Transaction> {
        let session = self.write().await?;
        session.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Transaction { session, finished: false })
    }

    async fn acquire(&self, read_only: bool, writer: Option<OwnedMutexGuard<()>>) -> Result<Session> {
        let permit =
            Arc::clone(&self.pool.permits).acquire_owned().await.map_err(|_| Error::PoolClosed)?;

        let pooled = self.pool.idle.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&self.pool.config)?,
        };
        conn.pragma_update(None, "query_only", read_only)
            .map_err(|err| Error::backing_store("PRAGMA query_only", 1, err))?;

        Ok(Session {
            conn: Mutex::new(Some(conn)),
            pool: Arc::clone(&self.pool),
            _permit: permit,
            _writer: writer,
        })
    }

    #[cfg(test)]
    pub(crate) fn idle_connections(&self) -> usize {
        self.pool.idle.lock().len()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.pool.config.path())
            .field("max_connections", &self.pool.config.max_connections())
            .field("idle", &self.pool.idle.lock().len())
            .finish()
    }
}

fn open_connection(config: &DatabaseConfig) -> Result<Connection> {
    let conn = Connection::open(config.path()).map_err(|err| Error::backing_store("OPEN", 0, err))?;
    conn.busy_timeout(config.busy_timeout())
        .map_err(|err| Error::backing_store("PRAGMA busy_timeout", 1, err))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(|err| Error::backing_store("PRAGMA journal_mode", 1, err))?;
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|err| Error::backing_store("PRAGMA foreign_keys", 1, err))?;
    Ok(conn)
}

/// A pooled connection with a query executor.
pub struct Session {
    conn: Mutex<Option<Connection>>,
    pool: Arc<Pool>,
    _permit: OwnedSemaphorePermit,
    _writer: Option<OwnedMutexGuard<()>>,
}

impl Session {
    fn with_conn<T>(
        &self,
        sql: &str,
        params: usize,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(Error::PoolClosed)?;
        f(conn).map_err(|err| Error::backing_store(sql, params, err))
    }

    /// Executes one statement and returns the number of changed rows.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the statement fails.
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        self.with_conn(sql, params.len(), |conn| conn.prepare_cached(sql)?.execute(params))
    }

    /// Executes a batch of parameterless statements.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_conn(sql, 0, |conn| conn.execute_batch(sql))
    }

    /// Runs a query and maps every row.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the query or a row mapping fails.
    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(sql, params.len(), |conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params, |row| map(row))?;
            let collected = rows.collect::<rusqlite::Result<Vec<T>>>();
            collected
        })
    }

    /// Runs a query expected to return at most one row.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if the query or the row mapping fails.
    pub fn query_row<T, F>(&self, sql: &str, params: &[&dyn ToSql], map: F) -> Result<Option<T>>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        self.with_conn(sql, params.len(), |conn| {
            conn.prepare_cached(sql)?.query_row(params, map).optional()
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.get_mut().take() {
            self.pool.release(conn);
        }
    }
}

/// A write transaction. Dropping it without [`commit`](Self::commit) rolls
/// back every statement issued through it.
pub struct Transaction {
    session: Session,
    finished: bool,
}

impl Transaction {
    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if `COMMIT` fails; the transaction is
    /// then rolled back on drop.
    pub fn commit(mut self) -> Result<()> {
        self.session.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Rolls the transaction back explicitly.
    ///
    /// # Errors
    ///
    /// Returns `Error::BackingStore` if `ROLLBACK` fails; the connection is
    /// then discarded instead of returned to the pool.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.session.execute_batch("ROLLBACK")
    }
}

impl Deref for Transaction {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.session.execute_batch("ROLLBACK") {
            Ok(()) => debug!("transaction rolled back"),
            Err(err) => warn!(error = %err, "rollback failed"),
        }
    }
}

/// Current time truncated to the millisecond precision stored on disk.
pub(crate) fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}

pub(crate) fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

pub(crate) fn optional_timestamp(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = row.get(idx)?;
    millis
        .map(|millis| {
            DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
        })
        .transpose()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn temp_database() -> (TempDir, Database) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = DatabaseConfig::new(dir.path().join("kasadb.sqlite3"));
        let db = Database::open(config).expect("Failed to open database");
        (dir, db)
    }

    fn count(session: &Session, table: &str) -> i64 {
        session
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), params![], |row| row.get(0))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_schema_created() {
        let (_dir, db) = temp_database();
        let session = db.read().await.unwrap();

        assert_eq!(count(&session, "entities"), 0);
        assert_eq!(count(&session, "encryption_keys"), 0);
        assert_eq!(count(&session, "blind_index"), 0);
    }

    #[tokio::test]
    async fn test_commit_persists() {
        let (_dir, db) = temp_database();

        let tx = db.transaction().await.unwrap();
        tx.execute(
            "INSERT INTO encryption_keys (uuid, encrypted_key, created_at) VALUES (?1, ?2, ?3)",
            params![vec![1u8; 16], vec![2u8; 40], 0i64],
        )
        .unwrap();
        tx.commit().unwrap();

        assert_eq!(count(&db.read().await.unwrap(), "encryption_keys"), 1);
    }

    #[tokio::test]
    async fn test_drop_rolls_back() {
        let (_dir, db) = temp_database();

        {
            let tx = db.transaction().await.unwrap();
            tx.execute(
                "INSERT INTO encryption_keys (uuid, encrypted_key, created_at) VALUES (?1, ?2, ?3)",
                params![vec![1u8; 16], vec![2u8; 40], 0i64],
            )
            .unwrap();
        }

        assert_eq!(count(&db.read().await.unwrap(), "encryption_keys"), 0);
    }

    #[tokio::test]
    async fn test_read_session_is_query_only() {
        let (_dir, db) = temp_database();
        let session = db.read().await.unwrap();

        let result = session.execute(
            "INSERT INTO encryption_keys (uuid, encrypted_key, created_at) VALUES (?1, ?2, ?3)",
            params![vec![1u8; 16], vec![2u8; 40], 0i64],
        );
        assert!(matches!(result, Err(Error::BackingStore { params: 3, .. })));
    }

    #[tokio::test]
    async fn test_connections_released_once() {
        let (_dir, db) = temp_database();
        assert_eq!(db.idle_connections(), 1);

        {
            let _a = db.read().await.unwrap();
            let _b = db.read().await.unwrap();
            assert_eq!(db.idle_connections(), 0);
        }
        assert_eq!(db.idle_connections(), 2);

        {
            let tx = db.transaction().await.unwrap();
            let _ = tx.execute("INSERT INTO no_such_table VALUES (1)", params![]);
        }
        assert_eq!(db.idle_connections(), 2);
    }

    #[tokio::test]
    async fn test_statement_error_context() {
        let (_dir, db) = temp_database();
        let session = db.read().await.unwrap();

        let err = session.query_row("SELECT * FROM missing WHERE a = ?1", params![1], |row| {
            row.get::<_, i64>(0)
        });
        match err {
            Err(Error::BackingStore { statement, params, .. }) => {
                assert_eq!(statement, "SELECT * FROM missing WHERE a = ?1");
                assert_eq!(params, 1);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
