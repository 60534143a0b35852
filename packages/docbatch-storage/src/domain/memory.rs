use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{BatchStateStore, BatchSummary, PersistedBatch};
use crate::{Result, StorageError};

/// In-memory batch state store
#[derive(Clone, Default)]
pub struct InMemoryBatchStateStore {
    records: Arc<Mutex<Vec<PersistedBatch>>>,
}

impl InMemoryBatchStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl BatchStateStore for InMemoryBatchStateStore {
    async fn save(&self, record: &PersistedBatch) -> Result<()> {
        let mut records = self.records.lock();

        // Replace existing snapshot for the same batch
        records.retain(|r| r.batch_id != record.batch_id);
        records.push(record.clone());
        Ok(())
    }

    async fn load(&self, batch_id: &str) -> Result<Option<PersistedBatch>> {
        let records = self.records.lock();
        Ok(records.iter().find(|r| r.batch_id == batch_id).cloned())
    }

    async fn load_latest(&self) -> Result<Option<PersistedBatch>> {
        let records = self.records.lock();
        // Vec is append-ordered; ties on saved_at resolve to the later push
        Ok(records
            .iter()
            .enumerate()
            .max_by_key(|(idx, r)| (r.saved_at, *idx))
            .map(|(_, r)| r.clone()))
    }

    async fn delete(&self, batch_id: &str) -> Result<()> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|r| r.batch_id != batch_id);

        if records.len() == before {
            return Err(StorageError::batch_not_found(batch_id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<BatchSummary>> {
        let records = self.records.lock();
        let mut summaries: Vec<BatchSummary> = records.iter().map(|r| r.summary()).collect();
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryBatchStateStore::new();
        let record = PersistedBatch::new("b-1", "idle", serde_json::json!({"n": 1}));

        store.save(&record).await.unwrap();

        let loaded = store.load("b-1").await.unwrap();
        assert_eq!(loaded, Some(record));
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let store = InMemoryBatchStateStore::new();

        store
            .save(&PersistedBatch::new("b-1", "idle", serde_json::json!({"n": 1})))
            .await
            .unwrap();
        store
            .save(&PersistedBatch::new("b-1", "processing", serde_json::json!({"n": 2})))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.load("b-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, "processing");
        assert_eq!(loaded.payload, serde_json::json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_load_latest() {
        let store = InMemoryBatchStateStore::new();
        assert!(store.load_latest().await.unwrap().is_none());

        store
            .save(&PersistedBatch::new("b-1", "completed", serde_json::json!({})))
            .await
            .unwrap();
        store
            .save(&PersistedBatch::new("b-2", "processing", serde_json::json!({})))
            .await
            .unwrap();

        let latest = store.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.batch_id, "b-2");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = InMemoryBatchStateStore::new();
        store
            .save(&PersistedBatch::new("b-1", "idle", serde_json::json!({})))
            .await
            .unwrap();

        store.delete("b-1").await.unwrap();
        assert!(store.is_empty());

        let err = store.delete("b-1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BatchNotFound);
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let store = InMemoryBatchStateStore::new();
        assert_eq!(store.load("nope").await.unwrap(), None);
    }
}
