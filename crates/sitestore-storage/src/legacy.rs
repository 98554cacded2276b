//! Legacy key-value backend
//!
//! All documents live in one JSON array under [`DOCUMENTS_KEY`]. Every mutation
//! rewrites the whole array; concurrent writers are last-write-wins.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use sitestore_types::{AppError, Document, DocumentPatch, Result, SiteConfig};

use crate::backend::{parse_export, DocumentBackend, ImportOutcome, Strategy};
use crate::error::EngineError;
use crate::kv::KeyValueStore;

pub const DOCUMENTS_KEY: &str = "sitestore.documents";
pub const MIGRATED_KEY: &str = "sitestore.migrated";

pub struct LegacyBackend {
    store: Arc<dyn KeyValueStore>,
}

impl LegacyBackend {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Every stored document, in storage order.
    ///
    /// An unreadable blob is an error, never an empty list, so the next write
    /// cannot overwrite it.
    pub fn read_all(&self) -> Result<Vec<Document>> {
        let Some(raw) = self.store.get_item(DOCUMENTS_KEY)? else {
            return Ok(Vec::new());
        };

        serde_json::from_str(&raw).map_err(|e| {
            AppError::from(EngineError::Corrupt {
                key: DOCUMENTS_KEY.to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn write_all(&self, documents: &[Document]) -> Result<()> {
        let raw = serde_json::to_string(documents).map_err(EngineError::from)?;
        self.store.set_item(DOCUMENTS_KEY, &raw)?;
        Ok(())
    }

    pub fn is_migration_complete(&self) -> Result<bool> {
        Ok(self.store.get_item(MIGRATED_KEY)?.as_deref() == Some("true"))
    }

    pub fn mark_migration_complete(&self) -> Result<()> {
        self.store.set_item(MIGRATED_KEY, "true")?;
        Ok(())
    }

    /// Append documents whose ids are not stored yet. Returns how many were added.
    pub fn import_documents(&self, documents: Vec<Document>) -> Result<usize> {
        let mut stored = self.read_all()?;
        let mut seen: HashSet<String> = stored.iter().map(|d| d.id.clone()).collect();

        let before = stored.len();
        for document in documents {
            if seen.insert(document.id.clone()) {
                stored.push(document);
            }
        }
        let added = stored.len() - before;

        if added > 0 {
            self.write_all(&stored)?;
        }
        Ok(added)
    }
}

#[async_trait]
impl DocumentBackend for LegacyBackend {
    fn strategy(&self) -> Strategy {
        Strategy::Legacy
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        let mut documents = self.read_all()?;
        documents.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(documents)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read_all()?.into_iter().find(|d| d.id == id))
    }

    async fn create(&self, label: String, config: SiteConfig) -> Result<Document> {
        let document = Document::create(label, config)?;

        let mut documents = self.read_all()?;
        documents.push(document.clone());
        self.write_all(&documents)?;

        tracing::info!(id = %document.id, strategy = "legacy", "Created document");
        Ok(document)
    }

    async fn update(&self, id: &str, patch: DocumentPatch) -> Result<Option<Document>> {
        let mut documents = self.read_all()?;
        let Some(document) = documents.iter_mut().find(|d| d.id == id) else {
            return Ok(None);
        };

        document.apply_patch(patch)?;
        let updated = document.clone();
        self.write_all(&documents)?;

        tracing::debug!(id = %id, strategy = "legacy", "Updated document");
        Ok(Some(updated))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut documents = self.read_all()?;
        let before = documents.len();
        documents.retain(|d| d.id != id);

        if documents.len() == before {
            return Ok(false);
        }

        self.write_all(&documents)?;
        tracing::info!(id = %id, strategy = "legacy", "Deleted document");
        Ok(true)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    async fn import_all(&self, json: &str) -> ImportOutcome {
        match parse_export(json).and_then(|documents| self.import_documents(documents)) {
            Ok(count) => ImportOutcome::imported(count),
            Err(e) => {
                tracing::warn!(code = %e.code(), error = %e, "Legacy import failed");
                ImportOutcome::failed(&e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKeyValueStore;
    use sitestore_types::ErrorCode;

    fn backend() -> (LegacyBackend, Arc<MemoryKeyValueStore>) {
        let store = Arc::new(MemoryKeyValueStore::new());
        (LegacyBackend::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_crud() {
        let (backend, _) = backend();

        let created = backend
            .create("Site 1".to_string(), SiteConfig::default())
            .await
            .unwrap();
        assert_eq!(created.created_at, created.updated_at);
        assert_eq!(backend.get_by_id(&created.id).await.unwrap(), Some(created.clone()));

        let updated = backend
            .update(&created.id, DocumentPatch::new().label("Renamed"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);

        assert!(backend.delete(&created.id).await.unwrap());
        assert!(!backend.delete(&created.id).await.unwrap());
        assert_eq!(backend.get_by_id(&created.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let (backend, _) = backend();
        let result = backend
            .update("missing", DocumentPatch::new().label("x"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(backend.store.get_item(DOCUMENTS_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_all_newest_first() {
        let (backend, _) = backend();
        let first = backend.create("A".into(), SiteConfig::default()).await.unwrap();
        let second = backend.create("B".into(), SiteConfig::default()).await.unwrap();
        backend
            .update(&first.id, DocumentPatch::new().label("A2"))
            .await
            .unwrap();

        let ids: Vec<String> = backend
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_not_overwritten() {
        let (backend, store) = backend();
        store.set_item(DOCUMENTS_KEY, "{not json").unwrap();

        let err = backend.get_all().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert!(!err.is_retryable());

        assert!(backend
            .create("A".into(), SiteConfig::default())
            .await
            .is_err());
        assert_eq!(
            store.get_item(DOCUMENTS_KEY).unwrap().as_deref(),
            Some("{not json")
        );
    }

    #[tokio::test]
    async fn test_quota_surfaces_as_quota_error() {
        let store = Arc::new(MemoryKeyValueStore::with_quota(64));
        let backend = LegacyBackend::new(store);

        let err = backend
            .create("A".repeat(100), SiteConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageQuotaExceeded);
        assert_eq!(backend.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_import_skips_existing_and_duplicates() {
        let (backend, _) = backend();
        let existing = backend.create("A".into(), SiteConfig::default()).await.unwrap();
        let fresh = Document::create("B", SiteConfig::default()).unwrap();

        let payload =
            serde_json::to_string(&vec![existing.clone(), fresh.clone(), fresh.clone()]).unwrap();
        let outcome = backend.import_all(&payload).await;
        assert_eq!(outcome, ImportOutcome::imported(1));
        assert_eq!(backend.count().await.unwrap(), 2);

        let again = backend.import_all(&backend.export_all().await.unwrap()).await;
        assert_eq!(again, ImportOutcome::imported(0));
    }

    #[tokio::test]
    async fn test_import_invalid_payload() {
        let (backend, _) = backend();
        let outcome = backend.import_all("{\"oops\":true}").await;
        assert!(!outcome.success);
        assert_eq!(outcome.count, 0);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_migration_flag() {
        let (backend, store) = backend();
        assert!(!backend.is_migration_complete().unwrap());

        store.set_item(MIGRATED_KEY, "yes").unwrap();
        assert!(!backend.is_migration_complete().unwrap());

        backend.mark_migration_complete().unwrap();
        assert!(backend.is_migration_complete().unwrap());
    }
}
