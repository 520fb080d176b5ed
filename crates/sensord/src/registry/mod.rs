//! Persisted per-sensor metadata.
//!
//! The registry records, for every sensor id ever observed, whether it has
//! been registered with the remote consumer and whether the user disabled it.
//! It is the single source of truth for suppressing updates.

mod sqlite;

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

pub use sqlite::SqliteRegistry;

/// Registry record for one sensor id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entry {
    pub registered: bool,
    pub disabled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("sensor not found in registry: {0}")]
    NotFound(String),

    #[error("registry is closed")]
    Closed,

    #[error("registry store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("invalid registry record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transactional key/value access to registry entries.
///
/// Operations are atomic per key; there is no atomicity across keys.
pub trait Registry: Send + Sync {
    /// Fetch the entry for `id`. Fails with [`RegistryError::NotFound`] if
    /// the id has never been seen.
    fn get(&self, id: &str) -> Result<Entry, RegistryError>;

    /// Insert or replace the entry for `id`.
    fn set(&self, id: &str, entry: Entry) -> Result<(), RegistryError>;

    /// Return the entry for `id`, creating it with default values if absent.
    /// Concurrent calls for the same new id create exactly one entry.
    fn add(&self, id: &str) -> Result<Entry, RegistryError>;

    /// Apply `f` to the entry for `id` (default if absent) and persist the
    /// result, all within one transaction. Returns the new entry.
    fn update(&self, id: &str, f: &dyn Fn(&mut Entry)) -> Result<Entry, RegistryError>;

    /// Remove every entry.
    fn reset(&self) -> Result<(), RegistryError>;

    /// Stop background maintenance and release the store.
    fn close(&self);

    fn set_registered(&self, id: &str, registered: bool) -> Result<Entry, RegistryError> {
        self.update(id, &|e: &mut Entry| e.registered = registered)
    }

    fn set_disabled(&self, id: &str, disabled: bool) -> Result<Entry, RegistryError> {
        self.update(id, &|e: &mut Entry| e.disabled = disabled)
    }

    fn is_registered(&self, id: &str) -> bool {
        self.get(id).map(|e| e.registered).unwrap_or(false)
    }

    fn is_disabled(&self, id: &str) -> bool {
        self.get(id).map(|e| e.disabled).unwrap_or(false)
    }
}

/// Delete an entire registry store directory. Missing directories are fine.
pub fn remove_store(dir: &Path) -> Result<(), RegistryError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
