//! Site configuration content
//!
//! A site is an ordered list of typed blocks plus free-form settings (theme, seo, ...).
//! Caller input goes through [`SiteConfig::from_value`], which rejects unknown shapes.
//! Data read back from storage goes through the lenient `Deserialize` impl, which
//! normalizes a missing `blocks` list to `[]` and drops blocks it cannot understand.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::error::AppError;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default, deserialize_with = "lenient_blocks")]
    pub blocks: Vec<Block>,
    /// Any other top-level keys, kept verbatim
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl SiteConfig {
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            settings: Map::new(),
        }
    }

    /// Strictly parse untrusted caller input.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => {
                return Err(AppError::validation_for(
                    "config",
                    "site configuration must be a JSON object",
                ))
            }
        };

        let blocks = match map.remove("blocks") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    Block::from_value(item).map_err(|reason| {
                        AppError::validation_for(format!("config.blocks[{}]", index), reason)
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(AppError::validation_for(
                    "config.blocks",
                    "blocks must be an array",
                ))
            }
        };

        let config = Self {
            blocks,
            settings: map,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that span blocks.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (index, block) in self.blocks.iter().enumerate() {
            block.validate().map_err(|reason| {
                AppError::validation_for(format!("config.blocks[{}]", index), reason)
            })?;
            if !seen.insert(block.id()) {
                return Err(AppError::validation_for(
                    format!("config.blocks[{}]", index),
                    format!("duplicate block id: {}", block.id()),
                ));
            }
        }
        Ok(())
    }
}

fn lenient_blocks<'de, D>(deserializer: D) -> std::result::Result<Vec<Block>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let items = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items,
        Some(other) => {
            tracing::warn!(found = %other, "Discarding non-array blocks value");
            return Ok(Vec::new());
        }
    };

    let mut seen = HashSet::new();
    let blocks = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| match Block::from_value(item) {
            Ok(block) if seen.insert(block.id().to_string()) => Some(block),
            Ok(block) => {
                tracing::warn!(index, block_id = %block.id(), "Dropping duplicate block");
                None
            }
            Err(reason) => {
                tracing::warn!(index, %reason, "Dropping unreadable block");
                None
            }
        })
        .collect();

    Ok(blocks)
}

/// A content block, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Block {
    Hero(HeroBlock),
    Text(TextBlock),
    Image(ImageBlock),
    Features(FeaturesBlock),
    CallToAction(CallToActionBlock),
    Footer(FooterBlock),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeroBlock {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBlock {
    pub id: String,
    pub src: String,
    #[serde(default)]
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesBlock {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default)]
    pub items: Vec<FeatureItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToActionBlock {
    pub id: String,
    #[serde(default)]
    pub heading: String,
    pub button_label: String,
    pub button_href: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterBlock {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub links: Vec<FooterLink>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FooterLink {
    pub label: String,
    pub href: String,
}

impl Block {
    /// Decode and validate a single block. The error is a human-readable reason.
    pub fn from_value(value: Value) -> std::result::Result<Self, String> {
        if !value.is_object() {
            return Err("block must be a JSON object".to_string());
        }
        let block: Block = serde_json::from_value(value).map_err(|e| e.to_string())?;
        block.validate()?;
        Ok(block)
    }

    pub fn id(&self) -> &str {
        match self {
            Block::Hero(b) => &b.id,
            Block::Text(b) => &b.id,
            Block::Image(b) => &b.id,
            Block::Features(b) => &b.id,
            Block::CallToAction(b) => &b.id,
            Block::Footer(b) => &b.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Block::Hero(_) => "hero",
            Block::Text(_) => "text",
            Block::Image(_) => "image",
            Block::Features(_) => "features",
            Block::CallToAction(_) => "call-to-action",
            Block::Footer(_) => "footer",
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id().trim().is_empty() {
            return Err(format!("{} block id cannot be empty", self.kind()));
        }

        match self {
            Block::Hero(b) if b.title.trim().is_empty() => {
                Err("hero title cannot be empty".to_string())
            }
            Block::Image(b) if b.src.trim().is_empty() => {
                Err("image src cannot be empty".to_string())
            }
            Block::CallToAction(b) if b.button_href.trim().is_empty() => {
                Err("call-to-action buttonHref cannot be empty".to_string())
            }
            Block::Features(b) if b.items.iter().any(|i| i.title.trim().is_empty()) => {
                Err("feature item title cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}
