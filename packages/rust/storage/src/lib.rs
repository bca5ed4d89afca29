//! libSQL-backed knowledge store (embedded, offline).
//!
//! The [`Storage`] struct wraps a libSQL database holding scan records
//! (files, code elements, patterns, classifications), the knowledge graph
//! (concepts, relationships, extraction records) and pipeline run history.
//!
//! **Access rules:**
//! - The orchestrator: read-write (sole writer) via [`Storage::open`]
//! - Snapshot consumers such as a dashboard: read-only via [`Storage::open_readonly`]
//!
//! Every write is a short transaction serialized behind a single write lock,
//! so conflicting upserts to the same concept or relationship never
//! interleave. The database runs in WAL mode: readers in other processes see
//! the last committed state while a write is in flight, and every connection
//! waits up to [`BUSY_TIMEOUT_MS`] on a lock before failing.

mod files;
mod knowledge;
mod migrations;
mod runs;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, OpenFlags, params};
use tokio::sync::{Mutex, MutexGuard};

use codelore_shared::{LoreError, Result};

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT_MS: u32 = 5000;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LoreError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        apply_pragmas(&conn, false).await?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` with SQLite's read-only flags.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LoreError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .flags(OpenFlags::SQLITE_OPEN_READ_ONLY)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        apply_pragmas(&conn, true).await?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Current `journal_mode` of the connection (`wal` once opened read-write).
    pub async fn journal_mode(&self) -> Result<String> {
        let mut rows = self
            .conn
            .query("PRAGMA journal_mode", params![])
            .await
            .map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => get_string(&row, 0),
            None => Err(LoreError::Storage("journal_mode returned no row".into())),
        }
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    LoreError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode, then take the write lock.
    async fn writer(&self) -> Result<MutexGuard<'_, ()>> {
        if self.readonly {
            return Err(LoreError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(self.write_lock.lock().await)
    }

    /// Run `SELECT COUNT(*)`-style queries that return one integer.
    async fn count(&self, sql: &str) -> Result<u64> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(storage_err)?;
        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(storage_err)?.max(0) as u64),
            None => Ok(0),
        }
    }
}

/// WAL plus a busy timeout. Read-only connections cannot switch the
/// journal mode, so they only get the timeout.
async fn apply_pragmas(conn: &Connection, readonly: bool) -> Result<()> {
    let mut pragmas = vec![format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")];
    if !readonly {
        pragmas.push("PRAGMA journal_mode = WAL".into());
        pragmas.push("PRAGMA synchronous = NORMAL".into());
    }
    for pragma in &pragmas {
        // Some pragmas answer with a row; drain it so the statement finishes.
        let mut rows = conn
            .query(pragma, params![])
            .await
            .map_err(|e| LoreError::Storage(format!("{pragma} failed: {e}")))?;
        while rows.next().await.map_err(storage_err)?.is_some() {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

pub(crate) fn storage_err(e: impl std::fmt::Display) -> LoreError {
    LoreError::Storage(e.to_string())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LoreError::Storage(format!("invalid date '{s}': {e}")))
}

pub(crate) fn get_string(row: &libsql::Row, idx: i32) -> Result<String> {
    row.get::<String>(idx).map_err(storage_err)
}

pub(crate) fn get_f64(row: &libsql::Row, idx: i32) -> Result<f64> {
    row.get::<f64>(idx).map_err(storage_err)
}

pub(crate) fn get_u32(row: &libsql::Row, idx: i32) -> Result<u32> {
    Ok(row.get::<i64>(idx).map_err(storage_err)?.clamp(0, u32::MAX as i64) as u32)
}

pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_ts(&get_string(row, idx)?)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| LoreError::Storage(format!("invalid JSON column: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(storage_err)
}

#[cfg(test)]
pub(crate) async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("codelore_test_{}.db", uuid::Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}
