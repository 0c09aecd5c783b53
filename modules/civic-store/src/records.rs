use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use civic_common::{EntityType, RawRecord, UpsertOutcome};

/// A record as held by storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub jurisdiction_id: String,
    pub entity_type: EntityType,
    pub natural_key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Moves only when `fields` actually change.
    pub updated_at: DateTime<Utc>,
    /// Modification timestamp touched on every upsert.
    pub last_seen_at: DateTime<Utc>,
}

/// Insert-or-update keyed by (jurisdiction, entity type, natural key).
///
/// Upserting the same record twice leaves everything but `last_seen_at` unchanged.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(
        &self,
        jurisdiction_id: &str,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome>;

    async fn get(
        &self,
        jurisdiction_id: &str,
        entity_type: EntityType,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>>;

    async fn count(&self, jurisdiction_id: &str) -> Result<u64>;
}

type RecordKey = (String, EntityType, String);

#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<RecordKey, StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StoredRecord> {
        self.guard().values().cloned().collect()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<RecordKey, StoredRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn upsert(
        &self,
        jurisdiction_id: &str,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let key = (
            jurisdiction_id.to_string(),
            record.entity_type,
            record.natural_key.clone(),
        );
        let mut records = self.guard();
        match records.get_mut(&key) {
            Some(existing) => {
                existing.last_seen_at = now;
                if existing.fields == record.fields {
                    Ok(UpsertOutcome::Unchanged)
                } else {
                    existing.fields = record.fields.clone();
                    existing.updated_at = now;
                    Ok(UpsertOutcome::Updated)
                }
            }
            None => {
                records.insert(
                    key,
                    StoredRecord {
                        jurisdiction_id: jurisdiction_id.to_string(),
                        entity_type: record.entity_type,
                        natural_key: record.natural_key.clone(),
                        fields: record.fields.clone(),
                        created_at: now,
                        updated_at: now,
                        last_seen_at: now,
                    },
                );
                Ok(UpsertOutcome::Created)
            }
        }
    }

    async fn get(
        &self,
        jurisdiction_id: &str,
        entity_type: EntityType,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>> {
        let key = (
            jurisdiction_id.to_string(),
            entity_type,
            natural_key.to_string(),
        );
        Ok(self.guard().get(&key).cloned())
    }

    async fn count(&self, jurisdiction_id: &str) -> Result<u64> {
        Ok(self
            .guard()
            .keys()
            .filter(|(j, _, _)| j == jurisdiction_id)
            .count() as u64)
    }
}

#[async_trait]
impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    async fn upsert(
        &self,
        jurisdiction_id: &str,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        (**self).upsert(jurisdiction_id, record, now).await
    }

    async fn get(
        &self,
        jurisdiction_id: &str,
        entity_type: EntityType,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>> {
        (**self).get(jurisdiction_id, entity_type, natural_key).await
    }

    async fn count(&self, jurisdiction_id: &str) -> Result<u64> {
        (**self).count(jurisdiction_id).await
    }
}
