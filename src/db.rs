//! SQLite access for services and data-access nodes.
//!
//! [`Database`] is the process-wide connection factory. A [`DbSession`] is
//! the connection/transaction handle shared by one service subtree of one
//! request: the owning service opens and closes transactions on it, its
//! data-access nodes run statements through it. rusqlite is synchronous, so
//! every session call runs on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tempfile::TempDir;
use thiserror::Error;
use tracing::warn;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no database is configured")]
    NotConfigured,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database location: {0}")]
    Io(#[from] std::io::Error),
    #[error("database task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("transaction is not opened")]
    TransactionNotOpen,
    #[error("transaction has already been opened")]
    TransactionAlreadyOpen,
}

impl DbError {
    /// Empty query results are not failures for most callers.
    pub fn is_no_rows(&self) -> bool {
        matches!(self, DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    path: PathBuf,
    /// Owns the directory of a temporary database; removed with the last handle.
    _dir: Option<TempDir>,
}

impl Database {
    /// Opens (creating if needed) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(path, None)
    }

    /// A private WAL database in a fresh temp directory.
    pub fn open_temporary() -> DbResult<Self> {
        let dir = tempfile::Builder::new().prefix("routekit-").tempdir()?;
        let path = dir.path().join("routekit.db");
        Self::init(path, Some(dir))
    }

    fn init(path: PathBuf, dir: Option<TempDir>) -> DbResult<Self> {
        let db = Self {
            inner: Arc::new(DatabaseInner { path, _dir: dir }),
        };
        db.connect()?.execute_batch("PRAGMA journal_mode = WAL;")?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Opens a new connection to the database.
    pub fn connect(&self) -> DbResult<Connection> {
        let conn = Connection::open(&self.inner.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(conn)
    }

    /// Runs a batch outside of any request, e.g. schema migrations at startup.
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        self.connect()?.execute_batch(sql)?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Connection/transaction handle shared by reference within a service subtree.
///
/// The connection is opened lazily on first use.
pub struct DbSession {
    state: Arc<Mutex<SessionState>>,
    db: Option<Database>,
}

#[derive(Default)]
struct SessionState {
    conn: Option<Connection>,
    in_tx: bool,
}

impl SessionState {
    fn conn(&mut self, db: Option<&Database>) -> DbResult<&Connection> {
        if self.conn.is_none() {
            let db = db.ok_or(DbError::NotConfigured)?;
            self.conn = Some(db.connect()?);
        }
        self.conn.as_ref().ok_or(DbError::NotConfigured)
    }
}

impl DbSession {
    pub fn new(db: Option<Database>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            db,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.db.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().in_tx
    }

    /// Runs `f` on the session's connection, inside the open transaction if any.
    pub async fn with_conn<R, F>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.run(move |state, db| Ok(f(state.conn(db)?)?)).await
    }

    pub(crate) async fn begin(&self) -> DbResult<()> {
        self.run(|state, db| {
            if state.in_tx {
                return Err(DbError::TransactionAlreadyOpen);
            }
            // Takes the write lock up front; a competing writer waits here.
            state.conn(db)?.execute_batch("BEGIN IMMEDIATE")?;
            state.in_tx = true;
            Ok(())
        })
        .await
    }

    pub(crate) async fn commit(&self) -> DbResult<()> {
        self.finish("COMMIT").await
    }

    pub(crate) async fn rollback(&self) -> DbResult<()> {
        self.finish("ROLLBACK").await
    }

    async fn finish(&self, statement: &'static str) -> DbResult<()> {
        self.run(move |state, db| {
            if !state.in_tx {
                return Err(DbError::TransactionNotOpen);
            }
            let conn = state.conn(db)?;
            let result = conn.execute_batch(statement);
            // A failed COMMIT can leave the transaction open; trust sqlite's view.
            let still_open = !conn.is_autocommit();
            state.in_tx = still_open;
            result.map_err(DbError::from)
        })
        .await
    }

    async fn run<R, F>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(&mut SessionState, Option<&Database>) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut state = state.lock();
            f(&mut state, db.as_ref())
        })
        .await?
    }
}

impl Drop for DbSession {
    fn drop(&mut self) {
        // A blocking call still holding the lock keeps its own handle; the
        // connection then rolls back when it closes.
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        if !state.in_tx {
            return;
        }
        warn!("db session dropped with an open transaction, rolling back");
        if let Some(conn) = state.conn.as_ref() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "rollback of abandoned transaction failed");
            }
        }
        state.in_tx = false;
    }
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSession")
            .field("db", &self.db)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn count(session: &DbSession) -> i64 {
        session
            .with_conn(|c| c.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)))
            .await
            .unwrap()
    }

    async fn insert(session: &DbSession, value: &str) {
        let value = value.to_string();
        session
            .with_conn(move |c| c.execute("INSERT INTO t (v) VALUES (?1)", [value]))
            .await
            .unwrap();
    }

    fn table() -> Database {
        let db = Database::open_temporary().unwrap();
        db.execute_batch("CREATE TABLE t (v TEXT)").unwrap();
        db
    }

    #[tokio::test]
    async fn test_rollback_discards_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("nested").join("t.db")).unwrap();
        db.execute_batch("CREATE TABLE t (v TEXT)").unwrap();

        let session = DbSession::new(Some(db.clone()));
        session.begin().await.unwrap();
        insert(&session, "a").await;
        assert_eq!(count(&session).await, 1);
        session.rollback().await.unwrap();
        assert!(matches!(session.commit().await, Err(DbError::TransactionNotOpen)));

        assert_eq!(count(&DbSession::new(Some(db))).await, 0);
    }

    #[tokio::test]
    async fn test_commit_persists_rows() {
        let db = table();

        let session = DbSession::new(Some(db.clone()));
        session.begin().await.unwrap();
        assert!(matches!(session.begin().await, Err(DbError::TransactionAlreadyOpen)));
        insert(&session, "a").await;
        session.commit().await.unwrap();
        assert!(!session.in_transaction());

        assert_eq!(count(&DbSession::new(Some(db))).await, 1);
    }

    #[tokio::test]
    async fn test_reader_sees_snapshot_during_open_write() {
        let db = table();
        let writer = DbSession::new(Some(db.clone()));
        let reader = DbSession::new(Some(db));

        writer.begin().await.unwrap();
        insert(&writer, "a").await;
        assert_eq!(count(&reader).await, 0);
        writer.commit().await.unwrap();
        assert_eq!(count(&reader).await, 1);
    }

    #[tokio::test]
    async fn test_second_writer_waits_without_stalling_runtime() {
        let db = table();
        let first = DbSession::new(Some(db.clone()));
        let second = DbSession::new(Some(db));
        first.begin().await.unwrap();
        insert(&first, "a").await;

        let started = Instant::now();
        let (_, waited) = tokio::join!(
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                first.commit().await.unwrap();
            },
            async {
                second.begin().await.unwrap();
                started.elapsed()
            },
        );
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_secs(2));

        insert(&second, "b").await;
        second.commit().await.unwrap();
        assert_eq!(count(&second).await, 2);
    }

    #[tokio::test]
    async fn test_dropped_session_rolls_back() {
        let db = table();
        let abandoned = DbSession::new(Some(db.clone()));
        abandoned.begin().await.unwrap();
        insert(&abandoned, "a").await;
        drop(abandoned);

        let session = DbSession::new(Some(db));
        let started = Instant::now();
        session.begin().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(count(&session).await, 0);
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_unconfigured_session() {
        let session = DbSession::new(None);
        assert!(!session.is_configured());
        assert!(matches!(session.begin().await, Err(DbError::NotConfigured)));
        assert!(matches!(
            session.with_conn(|c| c.execute_batch("SELECT 1")).await,
            Err(DbError::NotConfigured)
        ));
    }

    #[test]
    fn test_open_reports_unusable_location() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Database::open(file.path().join("t.db")).unwrap_err();
        assert!(matches!(err, DbError::Io(_)));
    }

    #[tokio::test]
    async fn test_no_rows_detection() {
        let db = Database::open_temporary().unwrap();
        let err = DbSession::new(Some(db))
            .with_conn(|c| c.query_row("SELECT 1 WHERE 0", [], |r| r.get::<_, i64>(0)))
            .await
            .unwrap_err();
        assert!(err.is_no_rows());
    }
}
