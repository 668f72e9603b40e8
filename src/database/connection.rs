/*!
 * SQLite connection shared by every repository clone.
 *
 * There is exactly one connection per process. Async callers hop onto the
 * blocking pool before taking the lock. A closure that fails inside
 * `transaction_async` drops the transaction, which rolls it back.
 */

use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use rusqlite::{Connection, Transaction};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::schema;

const DEFAULT_DB_FILENAME: &str = "namesake.db";

/// Directory under the user's local data directory
const DEFAULT_DB_DIRNAME: &str = "namesake";

/// How long a statement waits on a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const IN_MEMORY: &str = ":memory:";

/// Shared handle to the pipeline database
#[derive(Clone)]
pub struct DatabaseConnection {
    db_path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

fn lock(connection: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    connection
        .lock()
        .map_err(|e| anyhow!("Database connection lock poisoned: {}", e))
}

fn in_transaction<T>(conn: &mut Connection, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
    let tx = conn.transaction().context("Failed to begin transaction")?;
    let value = f(&tx)?;
    tx.commit().context("Failed to commit transaction")?;
    Ok(value)
}

impl DatabaseConnection {
    /// Open the database at `default_database_path`
    pub fn new_default() -> Result<Self> {
        Self::new(Self::default_database_path()?)
    }

    /// Open or create a database file at the current schema version
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        info!("Opening database at {:?}", db_path);
        let conn = Connection::open(&db_path).with_context(|| format!("Failed to open database {:?}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::from_connection(conn, db_path)
    }

    /// Private in-memory database, used by tests
    pub fn new_in_memory() -> Result<Self> {
        debug!("Creating in-memory database");
        let conn = Connection::open_in_memory().context("Failed to create in-memory database")?;
        Self::from_connection(conn, PathBuf::from(IN_MEMORY))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> Result<Self> {
        schema::initialize_schema(&conn)?;
        Ok(Self {
            db_path,
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// `<local data dir>/namesake/namesake.db`
    pub fn default_database_path() -> Result<PathBuf> {
        let base_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .or_else(|| dirs::home_dir().map(|h| h.join(".local").join("share")))
            .ok_or_else(|| anyhow!("Could not determine a data directory for the database"))?;

        Ok(base_dir.join(DEFAULT_DB_DIRNAME).join(DEFAULT_DB_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY
    }

    /// Run `f` on the calling thread
    ///
    /// Only for callers that are already off the async runtime.
    pub fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = lock(&self.connection)?;
        f(&guard)
    }

    /// Run `f` on the blocking pool
    pub async fn execute_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let guard = lock(&connection)?;
            f(&guard)
        })
        .await
        .context("Database task panicked")?
    }

    /// Run `f` in a transaction on the calling thread
    pub fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut guard = lock(&self.connection)?;
        in_transaction(&mut guard, f)
    }

    /// Run `f` in a transaction on the blocking pool
    pub async fn transaction_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&connection)?;
            in_transaction(&mut guard, f)
        })
        .await
        .context("Database transaction task panicked")?
    }

    /// Row counts for the `status` output
    pub fn stats(&self) -> Result<DatabaseStats> {
        let mut stats = self.execute(|conn| {
            Ok(conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM works),
                    (SELECT COUNT(*) FROM chapters),
                    (SELECT COUNT(*) FROM entities),
                    (SELECT COUNT(*) FROM jobs WHERE status IN ('pending', 'in_progress', 'failed'))",
                [],
                |row| {
                    Ok(DatabaseStats {
                        work_count: row.get(0)?,
                        chapter_count: row.get(1)?,
                        entity_count: row.get(2)?,
                        active_job_count: row.get(3)?,
                        file_size_bytes: 0,
                    })
                },
            )?)
        })?;

        if !self.is_in_memory() {
            stats.file_size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(stats)
    }
}

impl fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("db_path", &self.db_path)
            .finish()
    }
}

/// Row counts across the pipeline tables
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub work_count: i64,
    /// Source and translated chapters together
    pub chapter_count: i64,
    pub entity_count: i64,
    /// Jobs pending, running or waiting for a retry
    pub active_job_count: i64,
    pub file_size_bytes: u64,
}

impl fmt::Display for DatabaseStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Works: {}, Chapters: {}, Entities: {}, Active jobs: {}, Size: {} KB",
            self.work_count,
            self.chapter_count,
            self.entity_count,
            self.active_job_count,
            self.file_size_bytes / 1024
        )
    }
}
