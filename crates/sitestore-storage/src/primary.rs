//! Primary SQLite backend
//!
//! Each operation runs on the blocking pool with its own connection and a single
//! transaction, guarded by retry and, when configured, a circuit breaker.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;

use sitestore_resilience::{retry, CircuitBreaker, RetryOptions};
use sitestore_types::{AppError, Document, DocumentPatch, Result, SiteConfig};

use crate::backend::{parse_export, DocumentBackend, ImportOutcome, Strategy};
use crate::database::Database;
use crate::error::EngineError;

type EngineResult<T> = std::result::Result<T, EngineError>;

const SELECT_COLUMNS: &str =
    "id, label, config, prompt_history, created_at, updated_at, user_id";

pub struct PrimaryBackend {
    db: Arc<Database>,
    retry: RetryOptions,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl PrimaryBackend {
    /// Open the database, upgrading the schema if needed.
    ///
    /// This also tells whether the engine is usable. `StorageUnavailable` means it
    /// cannot be used here; an upgrade-blocked `StorageError` (see
    /// [`is_upgrade_blocked`](crate::is_upgrade_blocked)) means it is busy for now.
    pub async fn open(path: impl Into<PathBuf>, quota_bytes: Option<u64>) -> Result<Self> {
        let path = path.into();
        let opened = tokio::task::spawn_blocking(move || Database::open(path, quota_bytes))
            .await
            .map_err(|e| AppError::from(EngineError::Task(e.to_string())))?;

        let db = opened.map_err(|err| match err {
            err @ EngineError::UpgradeBlocked(_) => AppError::from(err),
            err => {
                AppError::storage_unavailable(format!("Primary storage unavailable: {}", err))
                    .with_cause(err)
            }
        })?;

        tracing::debug!(path = %db.path().display(), "Primary storage opened");

        Ok(Self {
            db: Arc::new(db),
            retry: RetryOptions::storage_transaction(),
            breaker: None,
        })
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Run `f` in one transaction, through the breaker and the retry executor.
    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn(&Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let attempt = || {
            let db = Arc::clone(&self.db);
            let f = Arc::clone(&f);
            async move {
                tokio::task::spawn_blocking(move || db.transaction(|tx| (*f)(tx)))
                    .await
                    .map_err(|e| AppError::from(EngineError::Task(e.to_string())))?
            }
        };

        let result = match &self.breaker {
            Some(breaker) => breaker.execute(|| retry(attempt, &self.retry)).await,
            None => retry(attempt, &self.retry).await,
        };

        if let Err(e) = &result {
            tracing::warn!(
                operation,
                code = %e.code(),
                error = %e,
                "Primary storage operation failed"
            );
        }
        result
    }

    /// Insert documents whose ids are not stored yet, in one transaction.
    pub async fn import_documents(&self, documents: Vec<Document>) -> Result<usize> {
        let total = documents.len();
        let inserted = self
            .run("import", move |conn| {
                let mut inserted = 0;
                for document in &documents {
                    inserted += insert_document(conn, document, true)?;
                }
                Ok(inserted)
            })
            .await?;

        tracing::info!(total, inserted, "Imported documents into primary storage");
        Ok(inserted)
    }
}

#[async_trait]
impl DocumentBackend for PrimaryBackend {
    fn strategy(&self) -> Strategy {
        Strategy::Primary
    }

    async fn get_all(&self) -> Result<Vec<Document>> {
        self.run("get_all", |conn| Ok(select_all(conn)?)).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Document>> {
        let id = id.to_string();
        self.run("get_by_id", move |conn| Ok(select_one(conn, &id)?)).await
    }

    async fn create(&self, label: String, config: SiteConfig) -> Result<Document> {
        let document = Document::create(label, config)?;

        let stored = document.clone();
        self.run("create", move |conn| {
            insert_document(conn, &stored, false)?;
            Ok(())
        })
        .await?;

        tracing::info!(id = %document.id, strategy = "primary", "Created document");
        Ok(document)
    }

    async fn update(&self, id: &str, patch: DocumentPatch) -> Result<Option<Document>> {
        patch.validate()?;

        let id = id.to_string();
        let updated = self
            .run("update", move |conn| {
                let Some(mut document) = select_one(conn, &id)? else {
                    return Ok(None);
                };
                document.apply_patch(patch.clone())?;
                write_document(conn, &document)?;
                Ok(Some(document))
            })
            .await?;

        if let Some(document) = &updated {
            tracing::debug!(id = %document.id, strategy = "primary", "Updated document");
        }
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let target = id.to_string();
        let deleted = self
            .run("delete", move |conn| {
                if select_one(conn, &target)?.is_none() {
                    return Ok(false);
                }
                conn.execute("DELETE FROM documents WHERE id = ?1", [&target])
                    .map_err(EngineError::from)?;
                Ok(true)
            })
            .await?;

        if deleted {
            tracing::info!(id = %id, strategy = "primary", "Deleted document");
        }
        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        self.run("count", |conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
                .map_err(EngineError::from)?;
            Ok(count as usize)
        })
        .await
    }

    async fn import_all(&self, json: &str) -> ImportOutcome {
        let result = match parse_export(json) {
            Ok(documents) => self.import_documents(documents).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(count) => ImportOutcome::imported(count),
            Err(e) => {
                tracing::warn!(code = %e.code(), error = %e, "Primary import failed");
                ImportOutcome::failed(&e)
            }
        }
    }
}

fn timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(id: &str, value: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Corrupt {
            key: id.to_string(),
            reason: format!("bad timestamp {:?}: {}", value, e),
        })
}

/// Raw column values, decoded outside the row callback.
struct DocumentRow {
    id: String,
    label: String,
    config: String,
    prompt_history: String,
    created_at: String,
    updated_at: String,
    user_id: Option<String>,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            label: row.get(1)?,
            config: row.get(2)?,
            prompt_history: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            user_id: row.get(6)?,
        })
    }

    fn into_document(self) -> EngineResult<Document> {
        let config: SiteConfig = serde_json::from_str(&self.config)?;
        let prompt_history: Vec<String> = serde_json::from_str(&self.prompt_history)?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let updated_at = parse_timestamp(&self.id, &self.updated_at)?;

        Ok(Document {
            id: self.id,
            label: self.label,
            config,
            prompt_history,
            created_at,
            updated_at,
            user_id: self.user_id,
        })
    }
}

fn select_all(conn: &Connection) -> EngineResult<Vec<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM documents ORDER BY updated_at DESC",
        SELECT_COLUMNS
    ))?;
    let rows = stmt
        .query_map([], DocumentRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter().map(DocumentRow::into_document).collect()
}

fn select_one(conn: &Connection, id: &str) -> EngineResult<Option<Document>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM documents WHERE id = ?1", SELECT_COLUMNS),
            [id],
            DocumentRow::from_row,
        )
        .optional()?;

    row.map(DocumentRow::into_document).transpose()
}

/// Returns the number of rows inserted (0 when `skip_existing` and the id is taken).
fn insert_document(
    conn: &Connection,
    document: &Document,
    skip_existing: bool,
) -> EngineResult<usize> {
    let sql = if skip_existing {
        "INSERT INTO documents (id, label, config, prompt_history, created_at, updated_at, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(id) DO NOTHING"
    } else {
        "INSERT INTO documents (id, label, config, prompt_history, created_at, updated_at, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    };

    let inserted = conn.execute(
        sql,
        params![
            document.id,
            document.label,
            serde_json::to_string(&document.config)?,
            serde_json::to_string(&document.prompt_history)?,
            timestamp(&document.created_at),
            timestamp(&document.updated_at),
            document.user_id,
        ],
    )?;
    Ok(inserted)
}

fn write_document(conn: &Connection, document: &Document) -> EngineResult<()> {
    conn.execute(
        "UPDATE documents
         SET label = ?2, config = ?3, prompt_history = ?4, updated_at = ?5
         WHERE id = ?1",
        params![
            document.id,
            document.label,
            serde_json::to_string(&document.config)?,
            serde_json::to_string(&document.prompt_history)?,
            timestamp(&document.updated_at),
        ],
    )?;
    Ok(())
}
