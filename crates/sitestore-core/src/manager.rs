//! Storage manager
//!
//! Picks a backend on first use and, when the primary engine is available,
//! copies legacy documents into it once. Every CRUD call goes to the active
//! backend.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use sitestore_resilience::CircuitBreaker;
use sitestore_storage::{
    is_upgrade_blocked, DocumentBackend, FileKeyValueStore, ImportOutcome, KeyValueStore,
    LegacyBackend, PrimaryBackend, Strategy,
};
use sitestore_types::{AppError, Document, DocumentPatch, Result, SiteConfig};

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub strategy: Strategy,
    pub count: usize,
    /// Byte length of the export JSON
    pub estimated_size_bytes: usize,
}

pub struct StorageManager {
    config: Config,
    legacy: Arc<LegacyBackend>,
    /// `None` until initialized. Held across init so concurrent first callers wait.
    active: Mutex<Option<Arc<dyn DocumentBackend>>>,
}

impl StorageManager {
    /// Create a manager whose legacy engine lives in `config.legacy_dir`.
    pub fn new(config: Config) -> Result<Self> {
        let store = FileKeyValueStore::open(&config.legacy_dir, config.legacy_quota_bytes)
            .map_err(|e| {
                AppError::from(e).with_user_message("Local storage could not be opened.")
            })?;
        Ok(Self::with_legacy_store(config, Arc::new(store)))
    }

    pub fn with_legacy_store(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            config,
            legacy: Arc::new(LegacyBackend::new(store)),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize if needed and report the active strategy.
    ///
    /// If the primary engine cannot be used the legacy one takes over. A schema
    /// upgrade blocked by another connection is returned as an error instead and
    /// nothing is cached, so the next call tries again.
    pub async fn initialize(&self) -> Result<Strategy> {
        Ok(self.backend().await?.strategy())
    }

    pub async fn strategy(&self) -> Result<Strategy> {
        self.initialize().await
    }

    /// Forget the active backend and run initialization again.
    pub async fn reset(&self) -> Result<Strategy> {
        let mut active = self.active.lock().await;
        *active = None;

        let backend = self.select_backend().await?;
        let strategy = backend.strategy();
        *active = Some(backend);

        tracing::info!(strategy = %strategy, "Storage manager reset");
        Ok(strategy)
    }

    async fn backend(&self) -> Result<Arc<dyn DocumentBackend>> {
        let mut active = self.active.lock().await;
        if let Some(backend) = active.as_ref() {
            return Ok(Arc::clone(backend));
        }

        let backend = self.select_backend().await?;
        *active = Some(Arc::clone(&backend));
        Ok(backend)
    }

    async fn select_backend(&self) -> Result<Arc<dyn DocumentBackend>> {
        if !self.config.primary_enabled {
            tracing::info!(strategy = "legacy", "Primary storage disabled by configuration");
            return Ok(self.legacy.clone());
        }

        let primary = match PrimaryBackend::open(
            self.config.database_path.clone(),
            self.config.primary_quota_bytes,
        )
        .await
        {
            Ok(primary) => primary,
            Err(e) if is_upgrade_blocked(&e) => {
                // Writes made to legacy now would never be migrated.
                tracing::warn!(
                    code = %e.code(),
                    error = %e,
                    "Primary storage upgrade blocked, initialization will be retried"
                );
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    code = %e.code(),
                    error = %e,
                    "Primary storage unavailable, falling back to legacy storage"
                );
                return Ok(self.legacy.clone());
            }
        };

        let mut primary = primary.with_retry(self.config.retry_options());
        if let Some(breaker) = &self.config.circuit_breaker {
            let breaker = Arc::new(CircuitBreaker::new(breaker.options()));
            primary = primary.with_circuit_breaker(breaker);
        }

        if self.config.migration_enabled {
            self.migrate_legacy(&primary).await;
        }

        tracing::info!(strategy = "primary", "Storage initialized");
        Ok(Arc::new(primary))
    }

    /// Copy legacy documents into `primary` unless that already happened.
    ///
    /// Failures are logged and leave the flag unset so the next init tries again.
    async fn migrate_legacy(&self, primary: &PrimaryBackend) {
        match self.legacy.is_migration_complete() {
            Ok(true) => {
                tracing::debug!("Legacy migration already complete");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not read migration flag, migrating anyway");
            }
        }

        let documents = match self.legacy.read_all() {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(
                    code = %e.code(),
                    error = %e,
                    "Could not read legacy documents, migration skipped"
                );
                return;
            }
        };

        if documents.is_empty() {
            tracing::debug!("No legacy documents to migrate");
            self.mark_migrated();
            return;
        }

        let total = documents.len();
        match primary.import_documents(documents).await {
            Ok(inserted) => {
                tracing::info!(total, inserted, "Migrated legacy documents");
                self.mark_migrated();
            }
            Err(e) => {
                tracing::warn!(
                    total,
                    code = %e.code(),
                    error = %e,
                    "Legacy migration failed, will retry on next start"
                );
            }
        }
    }

    fn mark_migrated(&self) {
        if let Err(e) = self.legacy.mark_migration_complete() {
            tracing::warn!(error = %e, "Could not record migration flag");
        }
    }

    pub async fn get_all(&self) -> Result<Vec<Document>> {
        self.backend().await?.get_all().await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Document>> {
        self.backend().await?.get_by_id(id).await
    }

    pub async fn create(&self, label: impl Into<String>, config: SiteConfig) -> Result<Document> {
        let label = label.into();
        self.backend().await?.create(label, config).await
    }

    pub async fn update(&self, id: &str, patch: DocumentPatch) -> Result<Option<Document>> {
        self.backend().await?.update(id, patch).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.backend().await?.delete(id).await
    }

    /// All documents as a JSON array. Returns `"[]"` if they cannot be read.
    pub async fn export_all(&self) -> String {
        let exported = match self.backend().await {
            Ok(backend) => backend.export_all().await,
            Err(e) => Err(e),
        };
        match exported {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(code = %e.code(), error = %e, "Export failed");
                "[]".to_string()
            }
        }
    }

    pub async fn import_all(&self, json: &str) -> ImportOutcome {
        match self.backend().await {
            Ok(backend) => backend.import_all(json).await,
            Err(e) => {
                tracing::warn!(code = %e.code(), error = %e, "Import failed");
                ImportOutcome::failed(&e)
            }
        }
    }

    pub async fn get_stats(&self) -> Result<StorageStats> {
        let backend = self.backend().await?;
        let count = backend.count().await?;
        let estimated_size_bytes = backend.export_all().await?.len();

        Ok(StorageStats {
            strategy: backend.strategy(),
            count,
            estimated_size_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitestore_storage::{MemoryKeyValueStore, DOCUMENTS_KEY, MIGRATED_KEY};
    use sitestore_types::ErrorCode;
    use std::path::Path;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::new(dir.to_path_buf());
        config.retry_initial_delay_ms = 1;
        config
    }

    fn legacy_only(config: &Config) -> Config {
        let mut config = config.clone();
        config.primary_enabled = false;
        config
    }

    async fn seed_legacy(store: &Arc<MemoryKeyValueStore>, labels: &[&str]) -> Vec<Document> {
        let dir = tempfile::tempdir().unwrap();
        let config = legacy_only(&test_config(dir.path()));
        let manager = StorageManager::with_legacy_store(config, store.clone());

        let mut created = Vec::new();
        for label in labels {
            created.push(manager.create(*label, SiteConfig::default()).await.unwrap());
        }
        created
    }

    #[tokio::test]
    async fn test_create_then_rename() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(test_config(dir.path())).unwrap();

        let config = SiteConfig::from_value(serde_json::json!({ "blocks": [] })).unwrap();
        let site = manager.create("Site 1", config).await.unwrap();
        assert!(!site.id.is_empty());
        assert_eq!(site.created_at, site.updated_at);
        assert!(site.prompt_history.is_empty());
        assert!(site.config.blocks.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        let renamed = manager
            .update(&site.id, DocumentPatch::new().label("Site 1 Renamed"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(renamed.label, "Site 1 Renamed");
        assert_eq!(renamed.created_at, site.created_at);
        assert!(renamed.updated_at > site.updated_at);
        assert_eq!(manager.strategy().await.unwrap(), Strategy::Primary);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(test_config(dir.path())).unwrap();
        let site = manager.create("Doomed", SiteConfig::default()).await.unwrap();

        assert!(manager.delete(&site.id).await.unwrap());
        assert_eq!(manager.get_by_id(&site.id).await.unwrap(), None);
        assert!(!manager.delete(&site.id).await.unwrap());
        assert!(manager.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrates_legacy_documents_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        let seeded = seed_legacy(&store, &["One", "Two", "Three"]).await;

        let manager = StorageManager::with_legacy_store(test_config(dir.path()), store.clone());
        assert_eq!(manager.initialize().await.unwrap(), Strategy::Primary);

        let migrated = manager.get_all().await.unwrap();
        assert_eq!(migrated.len(), 3);
        for document in &seeded {
            let stored = manager.get_by_id(&document.id).await.unwrap();
            assert_eq!(stored.as_ref(), Some(document));
        }
        assert_eq!(store.get_item(MIGRATED_KEY).unwrap().as_deref(), Some("true"));

        // A second init must not copy anything back.
        assert!(manager.delete(&seeded[0].id).await.unwrap());
        assert_eq!(manager.reset().await.unwrap(), Strategy::Primary);
        assert_eq!(manager.get_all().await.unwrap().len(), 2);

        let restarted = StorageManager::with_legacy_store(test_config(dir.path()), store.clone());
        assert_eq!(restarted.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_legacy_marks_migration_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());

        let manager = StorageManager::with_legacy_store(test_config(dir.path()), store.clone());
        manager.initialize().await.unwrap();

        assert_eq!(store.get_item(MIGRATED_KEY).unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn test_migration_disabled_leaves_legacy_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        seed_legacy(&store, &["Old"]).await;

        let mut config = test_config(dir.path());
        config.migration_enabled = false;
        let manager = StorageManager::with_legacy_store(config, store.clone());

        assert_eq!(manager.initialize().await.unwrap(), Strategy::Primary);
        assert!(manager.get_all().await.unwrap().is_empty());
        assert_eq!(store.get_item(MIGRATED_KEY).unwrap(), None);
    }

    #[tokio::test]
    async fn test_falls_back_when_primary_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"regular file").unwrap();

        let store = Arc::new(MemoryKeyValueStore::new());
        let seeded = seed_legacy(&store, &["Kept"]).await;

        let mut config = test_config(dir.path());
        config.database_path = blocker.join("sitestore.db");
        let manager = StorageManager::with_legacy_store(config, store.clone());

        assert_eq!(manager.initialize().await.unwrap(), Strategy::Legacy);
        assert_eq!(manager.get_all().await.unwrap(), seeded);
        assert_eq!(store.get_item(MIGRATED_KEY).unwrap(), None);

        let created = manager.create("New", SiteConfig::default()).await.unwrap();
        assert_eq!(manager.get_by_id(&created.id).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_quota_failure_leaves_flag_unset() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        let huge = "x".repeat(200_000);
        seed_legacy(&store, &["small", huge.as_str()]).await;

        let mut config = test_config(dir.path());
        config.primary_quota_bytes = Some(40 * 1024);
        let manager = StorageManager::with_legacy_store(config, store.clone());

        assert_eq!(manager.initialize().await.unwrap(), Strategy::Primary);
        assert_eq!(manager.get_all().await.unwrap().len(), 0);
        assert_eq!(store.get_item(MIGRATED_KEY).unwrap(), None);

        let err = manager
            .create(huge.as_str(), SiteConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageQuotaExceeded);
    }

    #[tokio::test]
    async fn test_corrupt_legacy_blob_skips_migration() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set_item(DOCUMENTS_KEY, "[{broken").unwrap();

        let manager = StorageManager::with_legacy_store(test_config(dir.path()), store.clone());
        assert_eq!(manager.initialize().await.unwrap(), Strategy::Primary);
        assert_eq!(store.get_item(MIGRATED_KEY).unwrap(), None);
        assert_eq!(
            store.get_item(DOCUMENTS_KEY).unwrap().as_deref(),
            Some("[{broken")
        );
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(test_config(dir.path())).unwrap();
        manager.create("A", SiteConfig::default()).await.unwrap();
        manager.create("B", SiteConfig::default()).await.unwrap();

        let exported = manager.export_all().await;
        for _ in 0..2 {
            let outcome = manager.import_all(&exported).await;
            assert!(outcome.success);
            assert_eq!(outcome.count, 0);
        }
        assert_eq!(manager.get_all().await.unwrap().len(), 2);

        let other_dir = tempfile::tempdir().unwrap();
        let other = StorageManager::new(test_config(other_dir.path())).unwrap();
        assert_eq!(other.import_all(&exported).await, ImportOutcome::imported(2));

        let rejected = other.import_all("42").await;
        assert!(!rejected.success);
        assert_eq!(rejected.count, 0);
    }

    #[tokio::test]
    async fn test_export_failure_returns_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set_item(DOCUMENTS_KEY, "not json").unwrap();

        let manager =
            StorageManager::with_legacy_store(legacy_only(&test_config(dir.path())), store);
        assert_eq!(manager.export_all().await, "[]");
        assert!(manager.get_stats().await.is_err());
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(test_config(dir.path())).unwrap();
        manager.create("A", SiteConfig::default()).await.unwrap();

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.strategy, Strategy::Primary);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.estimated_size_bytes, manager.export_all().await.len());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["strategy"], "primary");
        assert_eq!(json["estimatedSizeBytes"], stats.estimated_size_bytes);
    }

    #[tokio::test]
    async fn test_concurrent_first_calls_share_one_init() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKeyValueStore::new());
        seed_legacy(&store, &["One", "Two"]).await;

        let manager = StorageManager::with_legacy_store(test_config(dir.path()), store);
        let (a, b, all) = tokio::join!(
            manager.initialize(),
            manager.strategy(),
            manager.get_all()
        );

        assert_eq!(a.unwrap(), Strategy::Primary);
        assert_eq!(b.unwrap(), Strategy::Primary);
        assert_eq!(all.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_file_backed_legacy_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = legacy_only(&test_config(dir.path()));

        let created = StorageManager::new(config.clone())
            .unwrap()
            .create("Persisted", SiteConfig::default())
            .await
            .unwrap();

        let reopened = StorageManager::new(config).unwrap();
        assert_eq!(reopened.initialize().await.unwrap(), Strategy::Legacy);
        assert_eq!(reopened.get_by_id(&created.id).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_upgrade_blocked_is_surfaced_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set_item(MIGRATED_KEY, "true").unwrap();

        // An older schema whose write lock is held elsewhere.
        let holder = rusqlite::Connection::open(&config.database_path).unwrap();
        holder
            .execute_batch(
                "CREATE TABLE schema_version (version INTEGER NOT NULL);
                 INSERT INTO schema_version (version) VALUES (1);
                 CREATE TABLE documents (
                     id TEXT PRIMARY KEY,
                     label TEXT NOT NULL,
                     config TEXT NOT NULL DEFAULT '{}',
                     prompt_history TEXT NOT NULL DEFAULT '[]',
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 BEGIN EXCLUSIVE;",
            )
            .unwrap();

        let manager = StorageManager::with_legacy_store(config.clone(), store.clone());
        let err = manager.initialize().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageError);
        assert!(is_upgrade_blocked(&err));

        let err = manager
            .create("Blocked", SiteConfig::default())
            .await
            .unwrap_err();
        assert!(is_upgrade_blocked(&err));
        assert_eq!(store.get_item(DOCUMENTS_KEY).unwrap(), None);

        holder.execute_batch("ROLLBACK;").unwrap();
        drop(holder);

        assert_eq!(manager.initialize().await.unwrap(), Strategy::Primary);
        let created = manager.create("Kept", SiteConfig::default()).await.unwrap();

        let restarted = StorageManager::with_legacy_store(config, store);
        assert_eq!(restarted.get_by_id(&created.id).await.unwrap(), Some(created));
    }
}
