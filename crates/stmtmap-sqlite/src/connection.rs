use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection as RawConnection;
use stmtmap_core::{Connection, ExecOutcome, Value};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::SqliteError;
use crate::statement::{execute_discarding_rows, SqliteStatement};

/// Applied to every connection at open time.
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA synchronous = NORMAL;
"#;

pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Clone, Debug)]
pub struct SqliteConfig {
    /// Size of rusqlite's prepared-statement LRU cache. Registered
    /// statements beyond this are recompiled on use.
    pub statement_cache_capacity: usize,
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

pub(crate) type SharedConnection = Arc<Mutex<Option<RawConnection>>>;

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Sync).
/// Clones share the same underlying connection.
#[derive(Clone, Debug)]
pub struct SqliteConnection {
    conn: SharedConnection,
    path: PathBuf,
}

impl SqliteConnection {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, SqliteError> {
        Self::open_with(path, &SqliteConfig::default())
    }

    pub fn open_with(path: &Path, config: &SqliteConfig) -> Result<Self, SqliteError> {
        if path == Path::new(":memory:") {
            return Self::in_memory_with(config);
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| SqliteError::Io(format!("create dir: {e}")))?;
        }

        let conn = RawConnection::open(path)?;
        configure(&conn, config)?;
        info!(path = %path.display(), "database opened");
        Ok(Self::wrap(conn, path.to_owned()))
    }

    /// Open an in-memory database.
    pub fn in_memory() -> Result<Self, SqliteError> {
        Self::in_memory_with(&SqliteConfig::default())
    }

    pub fn in_memory_with(config: &SqliteConfig) -> Result<Self, SqliteError> {
        let conn = RawConnection::open_in_memory()?;
        configure(&conn, config)?;
        Ok(Self::wrap(conn, PathBuf::from(":memory:")))
    }

    fn wrap(conn: RawConnection, path: PathBuf) -> Self {
        Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    /// Execute a closure with the raw rusqlite connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SqliteError>
    where
        F: FnOnce(&RawConnection) -> Result<T, SqliteError>,
    {
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or(SqliteError::ConnectionClosed)?;
        f(conn)
    }
}

fn configure(conn: &RawConnection, config: &SqliteConfig) -> Result<(), SqliteError> {
    conn.execute_batch(PRAGMAS)?;
    conn.busy_timeout(config.busy_timeout)?;
    conn.set_prepared_statement_cache_capacity(config.statement_cache_capacity);
    Ok(())
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), SqliteError> {
    if cancel.is_cancelled() {
        Err(SqliteError::Cancelled)
    } else {
        Ok(())
    }
}

impl Connection for SqliteConnection {
    type Error = SqliteError;
    type Statement = SqliteStatement;

    /// Compiles `query` into the connection's statement cache, so syntax
    /// and schema errors surface here rather than on first use.
    fn prepare(&self, query: &str, cancel: &CancellationToken) -> Result<SqliteStatement, SqliteError> {
        check_cancel(cancel)?;
        self.with_conn(|conn| {
            conn.prepare_cached(query)?;
            Ok(())
        })?;
        Ok(SqliteStatement::new(self.conn.clone(), query))
    }

    /// Without arguments, `query` may hold several `;`-separated statements
    /// and all of them run. With arguments it must be a single statement.
    /// Rows returned by any statement are discarded.
    fn exec(
        &self,
        query: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome, SqliteError> {
        check_cancel(cancel)?;
        self.with_conn(|conn| {
            if args.is_empty() {
                let before = conn.total_changes();
                conn.execute_batch(query)?;
                return Ok(ExecOutcome {
                    rows_affected: conn.total_changes() - before,
                    last_insert_id: Some(conn.last_insert_rowid()),
                });
            }
            let mut stmt = conn.prepare(query)?;
            execute_discarding_rows(conn, &mut stmt, args)
        })
    }

    /// Closing twice is a no-op. On failure the connection stays open so
    /// the close can be retried.
    fn close(&self) -> Result<(), SqliteError> {
        let mut guard = self.conn.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                info!(path = %self.path.display(), "database closed");
                Ok(())
            }
            Err((conn, e)) => {
                *guard = Some(conn);
                Err(e.into())
            }
        }
    }
}
