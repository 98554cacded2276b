//! Backend contract shared by both storage engines

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use sitestore_types::{AppError, Document, DocumentPatch, Result, SiteConfig};

/// Which engine is serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Transactional SQLite database
    Primary,
    /// Key-value fallback
    Legacy,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Primary => "primary",
            Strategy::Legacy => "legacy",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Strategy::Primary),
            "legacy" => Ok(Strategy::Legacy),
            _ => Err(format!("Unknown storage strategy: {}", s)),
        }
    }
}

/// Result of a bulk import. Imports report failure here instead of returning `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    /// Documents actually inserted; existing ids are skipped.
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ImportOutcome {
    pub fn imported(count: usize) -> Self {
        Self {
            success: true,
            count,
            error: None,
        }
    }

    pub fn failed(error: &AppError) -> Self {
        Self {
            success: false,
            count: 0,
            error: Some(error.message().to_string()),
        }
    }
}

/// Parse an export payload. Anything but a JSON array of documents is a validation error.
pub fn parse_export(json: &str) -> Result<Vec<Document>> {
    serde_json::from_str(json).map_err(|e| {
        AppError::validation_for("import", format!("expected a JSON array of documents: {}", e))
            .with_cause(e)
    })
}

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// All documents, most recently updated first.
    async fn get_all(&self) -> Result<Vec<Document>>;

    async fn get_by_id(&self, id: &str) -> Result<Option<Document>>;

    async fn create(&self, label: String, config: SiteConfig) -> Result<Document>;

    /// `None` when `id` is unknown.
    async fn update(&self, id: &str, patch: DocumentPatch) -> Result<Option<Document>>;

    /// `false` when `id` is unknown.
    async fn delete(&self, id: &str) -> Result<bool>;

    async fn count(&self) -> Result<usize>;

    async fn export_all(&self) -> Result<String> {
        let documents = self.get_all().await?;
        serde_json::to_string(&documents).map_err(|e| {
            AppError::storage(format!("Failed to serialize documents: {}", e))
                .with_retryable(false)
                .with_cause(e)
        })
    }

    async fn import_all(&self, json: &str) -> ImportOutcome;
}
