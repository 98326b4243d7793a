use super::{BirthdayStore, StoreError};
use crate::models::Birthday;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Process-local store for development and tests
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<String, Birthday>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl BirthdayStore for InMemoryStore {
    async fn upsert_if_absent(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(id) {
            return Ok(false);
        }
        records.insert(id.to_string(), Birthday::new(id, birthday));
        Ok(true)
    }

    async fn delete_if_present(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<Birthday>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Birthday>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn update_birthday(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<Option<Birthday>, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.get_mut(id).map(|record| {
            record.birthday = birthday;
            record.clone()
        }))
    }
}
