//! Document data structure

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::content::SiteConfig;
use crate::error::AppError;
use crate::Result;

/// A persisted, labeled website configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier, immutable
    pub id: String,
    /// Human-readable name
    pub label: String,
    /// Site content
    #[serde(default)]
    pub config: SiteConfig,
    /// Prompts used to generate or refine this site, oldest first
    #[serde(default)]
    pub prompt_history: Vec<String>,
    /// When the document was created, immutable
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
    /// Owner, when the host application knows one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Document {
    /// Create a new document, validating the label and content.
    pub fn create(label: impl Into<String>, config: SiteConfig) -> Result<Self> {
        let label = label.into();
        validate_label(&label)?;
        config.validate()?;

        let now = now_millis();

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            label,
            config,
            prompt_history: Vec::new(),
            created_at: now,
            updated_at: now,
            user_id: None,
        })
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Apply a partial update. `id` and `created_at` are never touched and
    /// `updated_at` always moves forward.
    pub fn apply_patch(&mut self, patch: DocumentPatch) -> Result<()> {
        patch.validate()?;

        if let Some(label) = patch.label {
            self.label = label;
        }
        if let Some(config) = patch.config {
            self.config = config;
        }
        if let Some(prompt_history) = patch.prompt_history {
            self.prompt_history = prompt_history;
        }

        self.touch();
        Ok(())
    }

    /// Advance `updated_at`, by at least one millisecond.
    pub fn touch(&mut self) {
        let now = now_millis();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::milliseconds(1)
        };
    }
}

/// Partial update for a [`Document`].
///
/// Identity fields are not representable here; unknown keys in JSON are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SiteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_history: Option<Vec<String>>,
}

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn config(mut self, config: SiteConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn prompt_history(mut self, prompt_history: Vec<String>) -> Self {
        self.prompt_history = Some(prompt_history);
        self
    }

    /// Check the fields a patch would write, without a document at hand.
    pub fn validate(&self) -> Result<()> {
        if let Some(label) = &self.label {
            validate_label(label)?;
        }
        if let Some(config) = &self.config {
            config.validate()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.config.is_none() && self.prompt_history.is_none()
    }
}

fn validate_label(label: &str) -> Result<()> {
    if label.trim().is_empty() {
        return Err(AppError::validation_for("label", "label cannot be empty"));
    }
    Ok(())
}

/// Current time truncated to the millisecond precision that gets persisted.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
