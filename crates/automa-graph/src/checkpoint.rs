use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use automa_core::config::AutomaConfig;
use automa_core::error::{AutomaError, Result};
use automa_core::types::Snapshot;

/// Persistent snapshot store backed by SQLite.
///
/// Keeps the latest snapshot per automa name, so a suspended run can be
/// picked up again by another process.
pub struct SnapshotStore {
    conn: Mutex<Connection>,
}

fn db_err(context: &str, e: impl std::fmt::Display) -> AutomaError {
    AutomaError::Database(format!("{}: {}", context, e))
}

impl SnapshotStore {
    /// Store described by the `[checkpoint]` section. `Ok(None)` if the
    /// section is absent or disabled.
    pub fn from_config(config: &AutomaConfig) -> Result<Option<Self>> {
        match &config.checkpoint {
            Some(checkpoint) if checkpoint.enabled => {
                Self::open(&config.snapshot_db_path()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(|e| db_err("Failed to open snapshot store", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 snapshot_id TEXT NOT NULL,
                 automa TEXT NOT NULL,
                 version INTEGER NOT NULL,
                 payload TEXT NOT NULL,
                 taken_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snapshots_automa
                 ON snapshots(automa, id DESC);",
        )
        .map_err(|e| db_err("Failed to initialize snapshot schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save a snapshot, replacing any earlier one for the same automa.
    /// Returns the id it was stored under.
    pub fn save(&self, snapshot: &Snapshot) -> Result<String> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let snapshot_id = uuid::Uuid::new_v4().to_string();
        let json = snapshot.to_json()?;

        conn.execute(
            "DELETE FROM snapshots WHERE automa = ?1",
            params![snapshot.automa],
        )
        .map_err(|e| db_err("Failed to clean old snapshots", e))?;

        conn.execute(
            "INSERT INTO snapshots (snapshot_id, automa, version, payload, taken_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot_id,
                snapshot.automa,
                snapshot.version as i64,
                json,
                snapshot.taken_at.to_rfc3339(),
            ],
        )
        .map_err(|e| db_err("Failed to save snapshot", e))?;

        Ok(snapshot_id)
    }

    /// Load the latest snapshot for an automa.
    pub fn load_latest(&self, automa: &str) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT payload FROM snapshots
                 WHERE automa = ?1
                 ORDER BY id DESC
                 LIMIT 1",
            )
            .map_err(|e| db_err("Failed to prepare query", e))?;

        let payload: Option<String> = match stmt.query_row(params![automa], |row| row.get(0)) {
            Ok(payload) => Some(payload),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(db_err("Failed to load snapshot", e)),
        };

        payload.map(|json| Snapshot::from_json(&json)).transpose()
    }

    /// Load a snapshot by the id `save` returned.
    pub fn load(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let payload: Option<String> = match conn.query_row(
            "SELECT payload FROM snapshots WHERE snapshot_id = ?1",
            params![snapshot_id],
            |row| row.get(0),
        ) {
            Ok(payload) => Some(payload),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(db_err("Failed to load snapshot", e)),
        };

        payload.map(|json| Snapshot::from_json(&json)).transpose()
    }

    /// Delete every snapshot of an automa.
    pub fn delete(&self, automa: &str) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| db_err("Lock poisoned", e))?;
        let deleted = conn
            .execute("DELETE FROM snapshots WHERE automa = ?1", params![automa])
            .map_err(|e| db_err("Failed to delete snapshots", e))?;
        Ok(deleted)
    }
}
