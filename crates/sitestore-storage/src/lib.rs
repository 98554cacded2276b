//! Sitestore Storage Layer
//!
//! Two document engines behind one async contract:
//! - `PrimaryBackend`: SQLite, one transaction per operation, versioned schema
//! - `LegacyBackend`: a JSON array in a key-value store
//!
//! Engine failures are `EngineError` internally and `AppError` at the boundary.

mod backend;
mod database;
mod error;
mod kv;
mod legacy;
mod migrations;
mod primary;

pub use backend::{parse_export, DocumentBackend, ImportOutcome, Strategy};
pub use database::Database;
pub use error::{is_upgrade_blocked, EngineError};
pub use kv::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, DEFAULT_KV_QUOTA_BYTES};
pub use legacy::{LegacyBackend, DOCUMENTS_KEY, MIGRATED_KEY};
pub use primary::PrimaryBackend;
