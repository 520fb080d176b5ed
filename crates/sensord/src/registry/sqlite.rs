use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::TransactionBehavior;
use rusqlite::params;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Entry;
use super::Registry;
use super::RegistryError;

/// How long a connection waits on a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry backed by a SQLite database in WAL mode.
///
/// # Schema
/// ```sql
/// CREATE TABLE registry (
///     id TEXT PRIMARY KEY,   -- sensor id
///     value TEXT NOT NULL    -- {"registered": bool, "disabled": bool}
/// );
/// ```
///
/// Foreground operations share one connection behind a mutex. Maintenance
/// opens its own connection and only runs passive checkpoints, which never
/// wait on readers or writers.
pub struct SqliteRegistry {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
    maintenance: CancellationToken,
}

impl SqliteRegistry {
    pub const FILE_NAME: &'static str = "registry.db";

    /// Open (creating if needed) the registry stored under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(Self::FILE_NAME);

        let conn = Self::connect(&db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS registry (
                id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        info!("Opened sensor registry at {}", db_path.display());

        Ok(Self {
            db_path,
            conn: Mutex::new(Some(conn)),
            maintenance: CancellationToken::new(),
        })
    }

    fn connect(db_path: &Path) -> Result<Connection, RegistryError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Ok(conn)
    }

    /// Path of the underlying database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Spawn the periodic maintenance task. It stops when [`Registry::close`]
    /// is called or `cancel` fires.
    pub fn start_maintenance(
        &self,
        cancel: &CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let stop = self.maintenance.clone();
        let cancel = cancel.clone();
        let db_path = self.db_path.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let path = db_path.clone();
                match tokio::task::spawn_blocking(move || Self::maintain(&path)).await {
                    Ok(Ok(())) => debug!("Registry maintenance complete"),
                    Ok(Err(e)) => warn!("Registry maintenance failed: {}", e),
                    Err(e) => warn!("Registry maintenance task failed: {}", e),
                }
            }
            debug!("Registry maintenance stopped");
        })
    }

    fn maintain(db_path: &Path) -> Result<(), RegistryError> {
        let conn = Self::connect(db_path)?;
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA optimize")?;
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let conn = guard.as_mut().ok_or(RegistryError::Closed)?;
        f(conn)
    }

    fn read(conn: &Connection, id: &str) -> Result<Option<Entry>, RegistryError> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM registry WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        value
            .map(|v| serde_json::from_str(&v).map_err(RegistryError::from))
            .transpose()
    }

    fn write(conn: &Connection, id: &str, entry: &Entry) -> Result<(), RegistryError> {
        let value = serde_json::to_string(entry)?;
        conn.execute(
            "INSERT INTO registry (id, value) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET value = excluded.value",
            params![id, value],
        )?;
        Ok(())
    }
}

impl Registry for SqliteRegistry {
    fn get(&self, id: &str) -> Result<Entry, RegistryError> {
        self.with_conn(|conn| {
            Self::read(conn, id)?.ok_or_else(|| RegistryError::NotFound(id.to_string()))
        })
    }

    fn set(&self, id: &str, entry: Entry) -> Result<(), RegistryError> {
        self.with_conn(|conn| Self::write(conn, id, &entry))
    }

    fn add(&self, id: &str) -> Result<Entry, RegistryError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = serde_json::to_string(&Entry::default())?;
            let inserted = tx.execute(
                "INSERT INTO registry (id, value) VALUES (?1, ?2)
                 ON CONFLICT(id) DO NOTHING",
                params![id, value],
            )?;
            let entry = Self::read(&tx, id)?.unwrap_or_default();
            tx.commit()?;

            if inserted > 0 {
                debug!("Added {} to registry", id);
            }
            Ok(entry)
        })
    }

    fn update(&self, id: &str, f: &dyn Fn(&mut Entry)) -> Result<Entry, RegistryError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut entry = Self::read(&tx, id)?.unwrap_or_default();
            f(&mut entry);
            Self::write(&tx, id, &entry)?;
            tx.commit()?;
            Ok(entry)
        })
    }

    fn reset(&self) -> Result<(), RegistryError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM registry", [])?;
            info!("Reset sensor registry ({} entries removed)", removed);
            Ok(())
        })
    }

    fn close(&self) {
        self.maintenance.cancel();

        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(conn) = conn {
            if let Err((_, e)) = conn.close() {
                warn!("Error closing sensor registry: {}", e);
            } else {
                debug!("Closed sensor registry");
            }
        }
    }
}

impl Drop for SqliteRegistry {
    fn drop(&mut self) {
        self.maintenance.cancel();
    }
}
