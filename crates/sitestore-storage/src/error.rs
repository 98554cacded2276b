//! Engine error types
//!
//! Raw failures from SQLite, the filesystem and JSON decoding. They never leave this
//! crate as-is: the adapters convert them into `AppError` at their boundary.

use sitestore_types::{to_app_error, AppError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema upgrade blocked by another connection: {0}")]
    UpgradeBlocked(String),

    #[error("Storage quota exceeded: {required} bytes needed, {limit} allowed")]
    QuotaExceeded { required: u64, limit: u64 },

    #[error("Corrupt data under {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<EngineError> for AppError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Sqlite(err) => sqlite_error(err),
            EngineError::Json(err) => {
                AppError::storage(format!("Stored data is not valid JSON: {}", err))
                    .with_retryable(false)
                    .with_cause(err)
            }
            EngineError::Io(err) => to_app_error(err),
            EngineError::UpgradeBlocked(reason) => {
                AppError::storage(format!("Database upgrade blocked: {}", reason))
                    .with_retryable(false)
                    .with_user_message(UPGRADE_BLOCKED_MESSAGE)
                    .with_cause(EngineError::UpgradeBlocked(reason))
            }
            err @ EngineError::QuotaExceeded { .. } => {
                AppError::storage_quota_exceeded(err.to_string())
            }
            err @ EngineError::Corrupt { .. } => {
                AppError::storage(err.to_string()).with_retryable(false)
            }
            EngineError::Task(reason) => {
                AppError::unknown(format!("Storage task failed: {}", reason))
            }
        }
    }
}

const UPGRADE_BLOCKED_MESSAGE: &str =
    "The site database is open in another window. Close other windows and reload.";

/// True when `error` is a schema upgrade held up by another connection.
///
/// The condition clears once the other connection lets go, so callers should
/// retry later rather than give up on the engine.
pub fn is_upgrade_blocked(error: &AppError) -> bool {
    error
        .cause()
        .and_then(|cause| cause.downcast_ref::<EngineError>())
        .map_or(false, |cause| matches!(cause, EngineError::UpgradeBlocked(_)))
}

/// Reclassify busy/locked failures met while opening or upgrading the schema.
pub(crate) fn upgrade_blocked(err: EngineError) -> EngineError {
    match err {
        EngineError::Sqlite(err) if is_contention(&err) => {
            EngineError::UpgradeBlocked(err.to_string())
        }
        other => other,
    }
}

fn sqlite_error(err: rusqlite::Error) -> AppError {
    let code = err.sqlite_error_code();
    match code {
        Some(rusqlite::ErrorCode::DiskFull) => {
            AppError::storage_quota_exceeded(format!("Database is full: {}", err)).with_cause(err)
        }
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
            AppError::storage(format!("Transaction contention: {}", err)).with_cause(err)
        }
        _ => AppError::storage(format!("Transaction failed: {}", err)).with_cause(err),
    }
}

/// True for busy/locked failures caused by another connection.
pub(crate) fn is_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitestore_types::ErrorCode;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn test_disk_full_is_quota() {
        let error: AppError = EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_FULL)).into();
        assert_eq!(error.code(), ErrorCode::StorageQuotaExceeded);
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_busy_is_retryable_storage() {
        let error: AppError = EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).into();
        assert_eq!(error.code(), ErrorCode::StorageError);
        assert!(error.is_retryable());
    }

    #[test]
    fn test_upgrade_blocked_is_not_retried() {
        let error: AppError = EngineError::UpgradeBlocked("locked".to_string()).into();
        assert_eq!(error.code(), ErrorCode::StorageError);
        assert!(!error.is_retryable());
        assert!(error.user_message().contains("another window"));
        assert!(is_upgrade_blocked(&error));

        let busy: AppError = EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)).into();
        assert!(!is_upgrade_blocked(&busy));
        assert!(!is_upgrade_blocked(&AppError::storage("database upgrade blocked")));
    }

    #[test]
    fn test_contention_becomes_upgrade_blocked() {
        let err = upgrade_blocked(EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY)));
        assert!(matches!(err, EngineError::UpgradeBlocked(_)));

        let err = upgrade_blocked(EngineError::from(sqlite_failure(rusqlite::ffi::SQLITE_FULL)));
        assert!(matches!(err, EngineError::Sqlite(_)));
    }

    #[test]
    fn test_kv_quota() {
        let error: AppError = EngineError::QuotaExceeded {
            required: 10,
            limit: 5,
        }
        .into();
        assert_eq!(error.code(), ErrorCode::StorageQuotaExceeded);
    }

    #[test]
    fn test_corrupt_json_is_not_retried() {
        let json_err = serde_json::from_str::<Vec<u8>>("{").unwrap_err();
        let error: AppError = EngineError::from(json_err).into();
        assert_eq!(error.code(), ErrorCode::StorageError);
        assert!(!error.is_retryable());
    }
}
