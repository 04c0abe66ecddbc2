//! The SQLite store and its typed operations
//!
//! One [`Store`] wraps one database file. The global store keeps the project
//! registry, global settings, and global knowledge; each project store keeps
//! tasks, groups, handoffs, logs, dependencies, workshop records, settings,
//! and domain knowledge. Both scopes share the same schema; the knowledge
//! table name is the only difference.
//!
//! Every public mutator runs inside its own transaction: writes either
//! commit or error, and reads issued after a returned write observe it.

mod dependencies;
mod groups;
mod handoffs;
mod knowledge;
mod migrations;
mod projects;
mod settings;
mod tasks;
mod workshop;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

pub use knowledge::NewKnowledge;
pub use tasks::NewTask;

/// Errors surfaced by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Dependency cycle: {}", .0.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
    DependencyCycle(Vec<i64>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A single SQLite-backed store (global or per-project scope)
pub struct Store {
    conn: Connection,
    path: PathBuf,
    knowledge_table: &'static str,
}

impl Store {
    /// Open the global store (projects registry, settings, global knowledge)
    pub fn open_global(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, "global_knowledge")
    }

    /// Open a per-project store (tasks, groups, domain knowledge, ...)
    pub fn open_project(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, "domain_knowledge")
    }

    fn open(path: impl AsRef<Path>, knowledge_table: &'static str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), knowledge_table, "Store::open: called");

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn,
            path,
            knowledge_table,
        };
        migrations::migrate(&store.conn, knowledge_table)?;
        Ok(store)
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn knowledge_table(&self) -> &'static str {
        self.knowledge_table
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Render a timestamp for storage
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a stored timestamp, defaulting to the epoch on corrupt data
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

pub(crate) fn opt_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().map(parse_ts)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::Store;
    use tempfile::TempDir;

    /// A project-scoped store over a temp directory, kept alive with it
    pub fn project_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_project(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    pub fn global_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_global(dir.path().join("global.db")).unwrap();
        (store, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b").join("store.db");
        let store = Store::open_project(&nested).unwrap();
        assert!(nested.exists());
        assert_eq!(store.path(), nested.as_path());
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        drop(Store::open_project(&path).unwrap());
        // Re-opening runs migrations again over the existing schema
        drop(Store::open_project(&path).unwrap());
    }

    #[test]
    fn test_parse_ts_corrupt_defaults_to_epoch() {
        assert_eq!(parse_ts("garbage"), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn test_ts_roundtrip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now));
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }
}
