//! Persistence for instance records.
//!
//! The lifecycle core only needs the small CRUD contract in [`InstanceStore`];
//! the backend is chosen by configuration.

#[cfg(feature = "libsql")]
pub mod libsql;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::DatabaseError;

pub use memory::MemoryStore;

/// File written when an instance is created without any files.
pub const DEFAULT_MAIN_FILE: &str = "index.js";
pub const DEFAULT_MAIN_SOURCE: &str = "// main bot file";

/// A stored bot instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub credential: SecretString,
    /// File name to source text. Never empty.
    pub files: BTreeMap<String, String>,
    /// Cached copy of the registry's "is it running" answer.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Source of the entry file: `index.js` if present, else the first file.
    pub fn main_source(&self) -> &str {
        self.files
            .get(DEFAULT_MAIN_FILE)
            .or_else(|| self.files.values().next())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Name of the entry file, if any file exists.
    pub fn main_file_name(&self) -> Option<&str> {
        if self.files.contains_key(DEFAULT_MAIN_FILE) {
            Some(DEFAULT_MAIN_FILE)
        } else {
            self.files.keys().next().map(String::as_str)
        }
    }
}

/// Fields for a new record.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub name: String,
    pub description: Option<String>,
    pub credential: SecretString,
    pub files: BTreeMap<String, String>,
}

/// Partial update merged into an existing record.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub credential: Option<SecretString>,
    pub files: Option<BTreeMap<String, String>>,
    pub active: Option<bool>,
}

impl InstancePatch {
    pub fn active(active: bool) -> Self {
        Self {
            active: Some(active),
            ..Self::default()
        }
    }

    pub fn files(files: BTreeMap<String, String>) -> Self {
        Self {
            files: Some(files),
            ..Self::default()
        }
    }

    /// Reject patches that would break record invariants.
    pub(crate) fn check(&self) -> Result<(), DatabaseError> {
        if let Some(files) = &self.files
            && files.is_empty()
        {
            return Err(DatabaseError::Constraint(
                "an instance must keep at least one file".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge this patch into `record` and refresh its update timestamp.
    pub(crate) fn apply(self, record: &mut InstanceRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(description) = self.description {
            record.description = description;
        }
        if let Some(credential) = self.credential {
            record.credential = credential;
        }
        if let Some(files) = self.files {
            record.files = files;
        }
        if let Some(active) = self.active {
            record.active = active;
        }
        record.updated_at = Utc::now();
    }
}

/// Build the record a backend stores for `new`.
pub(crate) fn new_record(id: String, new: NewInstance) -> InstanceRecord {
    let now = Utc::now();
    let files = if new.files.is_empty() {
        BTreeMap::from([(
            DEFAULT_MAIN_FILE.to_string(),
            DEFAULT_MAIN_SOURCE.to_string(),
        )])
    } else {
        new.files
    };
    InstanceRecord {
        id,
        name: new.name,
        description: new.description,
        credential: new.credential,
        files,
        active: false,
        created_at: now,
        updated_at: now,
    }
}

/// CRUD contract for instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, DatabaseError>;

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError>;

    async fn create_instance(&self, new: NewInstance) -> Result<InstanceRecord, DatabaseError>;

    /// Merge `patch` into the record. Returns `None` if the record does not exist.
    async fn update_instance(
        &self,
        id: &str,
        patch: InstancePatch,
    ) -> Result<Option<InstanceRecord>, DatabaseError>;

    /// Returns whether a record was deleted.
    async fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Add or replace one file.
    async fn put_file(
        &self,
        id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<InstanceRecord, DatabaseError> {
        let mut record = self.get_instance(id).await?.ok_or_else(|| not_found(id))?;
        record
            .files
            .insert(file_name.to_string(), content.to_string());
        self.update_instance(id, InstancePatch::files(record.files))
            .await?
            .ok_or_else(|| not_found(id))
    }

    /// Remove one file. Removing the last remaining file is rejected.
    async fn remove_file(&self, id: &str, file_name: &str) -> Result<InstanceRecord, DatabaseError> {
        let mut record = self.get_instance(id).await?.ok_or_else(|| not_found(id))?;
        if !record.files.contains_key(file_name) {
            return Err(DatabaseError::NotFound {
                entity: "file".to_string(),
                id: file_name.to_string(),
            });
        }
        if record.files.len() == 1 {
            return Err(DatabaseError::Constraint(format!(
                "cannot remove {file_name}: it is the last file of instance {id}"
            )));
        }
        record.files.remove(file_name);
        self.update_instance(id, InstancePatch::files(record.files))
            .await?
            .ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &str) -> DatabaseError {
    DatabaseError::NotFound {
        entity: "instance".to_string(),
        id: id.to_string(),
    }
}

/// Open the store selected by `config`.
pub async fn connect_from_config(
    config: &DatabaseConfig,
) -> Result<Arc<dyn InstanceStore>, DatabaseError> {
    match config.backend {
        DatabaseBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "libsql")]
        DatabaseBackend::LibSql => {
            let store = libsql::LibSqlStore::new_local(&config.libsql_path).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "libsql"))]
        DatabaseBackend::LibSql => Err(DatabaseError::Pool(
            "libsql backend requested but the `libsql` feature is disabled".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn record(files: &[(&str, &str)]) -> InstanceRecord {
        new_record(
            "id-1".to_string(),
            NewInstance {
                name: "bot".to_string(),
                description: None,
                credential: SecretString::from("tok"),
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        )
    }

    #[test]
    fn test_main_source_prefers_index() {
        let rec = record(&[("a.js", "A"), ("index.js", "I")]);
        assert_eq!(rec.main_source(), "I");
        assert_eq!(rec.main_file_name(), Some("index.js"));
    }

    #[test]
    fn test_main_source_falls_back_to_first_file() {
        let rec = record(&[("b.js", "B"), ("a.js", "A")]);
        assert_eq!(rec.main_source(), "A");
    }

    #[test]
    fn test_new_record_gets_default_file() {
        let rec = record(&[]);
        assert_eq!(rec.files.len(), 1);
        assert_eq!(rec.main_source(), DEFAULT_MAIN_SOURCE);
        assert!(!rec.active);
    }

    #[test]
    fn test_patch_merges_and_touches_timestamp() {
        let mut rec = record(&[("index.js", "x")]);
        let before = rec.updated_at;
        InstancePatch {
            name: Some("renamed".to_string()),
            credential: Some(SecretString::from("new")),
            ..InstancePatch::active(true)
        }
        .apply(&mut rec);
        assert_eq!(rec.name, "renamed");
        assert_eq!(rec.credential.expose_secret(), "new");
        assert!(rec.active);
        assert!(rec.updated_at >= before);
        assert_eq!(rec.main_source(), "x");
    }

    #[test]
    fn test_empty_file_map_is_rejected() {
        let patch = InstancePatch::files(BTreeMap::new());
        assert!(matches!(patch.check(), Err(DatabaseError::Constraint(_))));
    }
}
