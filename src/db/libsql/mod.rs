//! libSQL/Turso backend for the InstanceStore trait.
//!
//! Provides an embedded SQLite-compatible database using Turso's libSQL fork,
//! stored in a local file (no server needed).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::db::{InstancePatch, InstanceRecord, InstanceStore, NewInstance, new_record};
use crate::error::DatabaseError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    credential TEXT NOT NULL,
    files TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instances_created ON instances(created_at);
"#;

/// Explicit column list (matches positional access in `row_to_instance`).
const INSTANCE_COLUMNS: &str =
    "id, name, description, credential, files, active, created_at, updated_at";

/// libSQL/Turso database backend.
pub struct LibSqlStore {
    db: Arc<LibSqlDatabase>,
}

impl LibSqlStore {
    /// Create a new local embedded database.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {}", e))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Create a new connection to the database.
    ///
    /// Sets `PRAGMA busy_timeout = 5000` on every connection so concurrent
    /// writers wait up to 5 seconds instead of failing instantly with
    /// "database is locked".
    pub async fn connect(&self) -> Result<Connection, DatabaseError> {
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {}", e)))?;
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy_timeout: {}", e)))?;
        Ok(conn)
    }

    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute_batch(SCHEMA)
            .await
            .map_err(|e| DatabaseError::Migration(format!("libSQL migration failed: {}", e)))?;
        Ok(())
    }

    async fn fetch(conn: &Connection, id: &str) -> Result<Option<InstanceRecord>, DatabaseError> {
        let mut rows = conn
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances WHERE id = ?1"),
                libsql::params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_instance(&row)?)),
            None => Ok(None),
        }
    }

    async fn write(conn: &Connection, record: &InstanceRecord) -> Result<(), DatabaseError> {
        conn.execute(
            r#"
            INSERT INTO instances (id, name, description, credential, files, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                credential = excluded.credential,
                files = excluded.files,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
            libsql::params![
                record.id.as_str(),
                record.name.as_str(),
                opt_text(record.description.as_deref()),
                record.credential.expose_secret(),
                encode_files(&record.files)?,
                i64::from(record.active),
                fmt_ts(&record.created_at),
                fmt_ts(&record.updated_at),
            ],
        )
        .await?;
        Ok(())
    }
}

// ==================== Helper functions ====================

/// Parse an ISO-8601 timestamp string from SQLite into DateTime<Utc>.
///
/// Accepts RFC 3339 (our canonical write format) and SQLite's naive
/// `datetime()` output with or without fractional seconds.
pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(format!("unparseable timestamp: {:?}", s))
}

/// Format a DateTime<Utc> for SQLite storage (RFC 3339 with millisecond precision).
pub(crate) fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Extract a text column from a libsql Row, returning empty string for NULL.
pub(crate) fn get_text(row: &libsql::Row, idx: i32) -> String {
    row.get::<String>(idx).unwrap_or_default()
}

/// Extract an optional text column.
/// Returns None for SQL NULL, preserves empty strings as Some("").
pub(crate) fn get_opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

/// Convert an `Option<&str>` to a `libsql::Value` (Text or Null).
pub(crate) fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Parse a timestamp from a text column.
///
/// If the column is NULL or the value cannot be parsed, logs a warning and
/// returns the Unix epoch so the error is detectable rather than silently
/// replaced by the current time.
pub(crate) fn get_ts(row: &libsql::Row, idx: i32) -> DateTime<Utc> {
    match row.get::<String>(idx) {
        Ok(s) => match parse_timestamp(&s) {
            Ok(dt) => dt,
            Err(e) => {
                tracing::warn!("Timestamp parse failure at column {}: {}", idx, e);
                DateTime::UNIX_EPOCH
            }
        },
        Err(_) => DateTime::UNIX_EPOCH,
    }
}

fn encode_files(files: &BTreeMap<String, String>) -> Result<String, DatabaseError> {
    serde_json::to_string(files).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_instance(row: &libsql::Row) -> Result<InstanceRecord, DatabaseError> {
    let files: BTreeMap<String, String> = serde_json::from_str(&get_text(row, 4))
        .map_err(|e| DatabaseError::Serialization(format!("files column: {e}")))?;
    Ok(InstanceRecord {
        id: get_text(row, 0),
        name: get_text(row, 1),
        description: get_opt_text(row, 2),
        credential: SecretString::from(get_text(row, 3)),
        files,
        active: row.get::<i64>(5).unwrap_or(0) != 0,
        created_at: get_ts(row, 6),
        updated_at: get_ts(row, 7),
    })
}

#[async_trait]
impl InstanceStore for LibSqlStore {
    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        Self::fetch(&conn, id).await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {INSTANCE_COLUMNS} FROM instances ORDER BY created_at, id"),
                (),
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_instance(&row)?);
        }
        Ok(records)
    }

    async fn create_instance(&self, new: NewInstance) -> Result<InstanceRecord, DatabaseError> {
        let record = new_record(Uuid::new_v4().to_string(), new);
        let conn = self.connect().await?;
        Self::write(&conn, &record).await?;
        Ok(record)
    }

    async fn update_instance(
        &self,
        id: &str,
        patch: InstancePatch,
    ) -> Result<Option<InstanceRecord>, DatabaseError> {
        patch.check()?;
        let conn = self.connect().await?;
        let Some(mut record) = Self::fetch(&conn, id).await? else {
            return Ok(None);
        };
        patch.apply(&mut record);
        Self::write(&conn, &record).await?;
        Ok(Some(record))
    }

    async fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let affected = conn
            .execute("DELETE FROM instances WHERE id = ?1", libsql::params![id])
            .await?;
        Ok(affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, LibSqlStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LibSqlStore::new_local(&dir.path().join("test.db"))
            .await
            .unwrap();
        store.run_migrations().await.unwrap();
        (dir, store)
    }

    fn new_instance() -> NewInstance {
        NewInstance {
            name: "Ticket bot".to_string(),
            description: None,
            credential: SecretString::from("secret-1"),
            files: BTreeMap::from([
                ("index.js".to_string(), "client.login(YOUR_BOT_TOKEN)".to_string()),
                ("util.js".to_string(), "module.exports = {}".to_string()),
            ]),
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-01-15T10:30:00.123Z").is_ok());
        assert!(parse_timestamp("2024-01-15 10:30:00.123").is_ok());
        assert!(parse_timestamp("2024-01-15 10:30:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_round_trip_record() {
        let (_dir, store) = store().await;
        let created = store.create_instance(new_instance()).await.unwrap();

        let fetched = store.get_instance(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Ticket bot");
        assert_eq!(fetched.description, None);
        assert_eq!(fetched.credential.expose_secret(), "secret-1");
        assert_eq!(fetched.files, created.files);
        assert!(!fetched.active);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_dir, store) = store().await;
        let created = store.create_instance(new_instance()).await.unwrap();

        let updated = store
            .update_instance(&created.id, InstancePatch::active(true))
            .await
            .unwrap()
            .unwrap();
        assert!(updated.active);
        let listed = store.list_instances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].active);

        let rec = store.remove_file(&created.id, "util.js").await.unwrap();
        assert_eq!(rec.files.len(), 1);
        assert!(store.remove_file(&created.id, "index.js").await.is_err());

        assert!(store.delete_instance(&created.id).await.unwrap());
        assert!(store.get_instance(&created.id).await.unwrap().is_none());
        assert!(
            store
                .update_instance(&created.id, InstancePatch::active(false))
                .await
                .unwrap()
                .is_none()
        );
    }
}
