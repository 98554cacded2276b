//! Sitestore Core
//!
//! Entry point for hosts: build a [`Config`], create a [`StorageManager`] and call
//! the document API. The manager decides between the SQLite engine and the legacy
//! key-value engine and migrates between them once.

mod config;
mod manager;

pub use config::{CircuitBreakerConfig, Config};
pub use manager::{StorageManager, StorageStats};

// Re-export the document contract
pub use sitestore_resilience::{
    is_dependency_failure, CircuitBreaker, CircuitBreakerOptions, CircuitState, RetryOptions,
};
pub use sitestore_storage::{
    is_upgrade_blocked, DocumentBackend, FileKeyValueStore, ImportOutcome, KeyValueStore,
    LegacyBackend, MemoryKeyValueStore, PrimaryBackend, Strategy,
};
pub use sitestore_types::{
    to_app_error, user_message_of, AppError, Block, Document, DocumentPatch, ErrorCode, ErrorKind,
    SiteConfig,
};

pub type Result<T> = std::result::Result<T, AppError>;

/// Initialize logging. Later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
