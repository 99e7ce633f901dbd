use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;

/// Key/value persistence consumed by the client session.
pub trait SettingsStore: Send + Sync {
    /// `None` when nothing was ever saved under `key`.
    fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError>;

    fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError>;
}

/// SQLite-backed [`SettingsStore`]. Several namespaces share one file.
pub struct StateDb {
    conn: Mutex<Connection>,
    namespace: String,
}

impl StateDb {
    pub fn open(path: &Path, namespace: impl Into<String>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            namespace: namespace.into(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl SettingsStore for StateDb {
    fn load_state(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM state WHERE namespace = ?1 AND key = ?2",
                params![self.namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save_state(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO state (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![self.namespace, key, raw, chrono::Utc::now().to_rfc3339()],
        )?;
        debug!("Saved {}/{}", self.namespace, key);
        Ok(())
    }
}
