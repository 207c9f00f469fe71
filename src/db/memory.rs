//! In-memory store, used by tests and `DATABASE_BACKEND=memory`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{InstancePatch, InstanceRecord, InstanceStore, NewInstance, new_record};
use crate::error::DatabaseError;

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>, DatabaseError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceRecord>, DatabaseError> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn create_instance(&self, new: NewInstance) -> Result<InstanceRecord, DatabaseError> {
        let record = new_record(Uuid::new_v4().to_string(), new);
        self.records
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_instance(
        &self,
        id: &str,
        patch: InstancePatch,
    ) -> Result<Option<InstanceRecord>, DatabaseError> {
        patch.check()?;
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(id) else {
            return Ok(None);
        };
        patch.apply(record);
        Ok(Some(record.clone()))
    }

    async fn delete_instance(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}
