//! Application error taxonomy
//!
//! Every failure that crosses the storage boundary is an [`AppError`].
//! Native errors are wrapped and classified with [`to_app_error`], never surfaced raw.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Boxed native error accepted by [`to_app_error`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

const QUOTA_TOKENS: &[&str] = &[
    "quota",
    "disk is full",
    "diskfull",
    "no space left",
    "storage full",
];

const STORAGE_TOKENS: &[&str] = &[
    "storage",
    "database",
    "sqlite",
    "transaction",
    "indexeddb",
    "i/o",
];

/// Stable, machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    StorageError,
    StorageQuotaExceeded,
    StorageUnavailable,
    ValidationError,
    NetworkError,
    ApiError,
    NotFound,
    ConfigError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::StorageQuotaExceeded => "STORAGE_QUOTA_EXCEEDED",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Message shown to the user when nothing more specific is known.
    pub fn default_user_message(&self) -> &'static str {
        match self {
            ErrorCode::StorageError => "We couldn't save your changes. Please try again.",
            ErrorCode::StorageQuotaExceeded => {
                "Storage is full. Delete some old sites to free up space."
            }
            ErrorCode::StorageUnavailable => {
                "Storage is not available. Check your browser settings or private browsing mode."
            }
            ErrorCode::ValidationError => {
                "Some of the data is invalid. Please check it and try again."
            }
            ErrorCode::NetworkError => "Network error. Check your connection and try again.",
            ErrorCode::ApiError => {
                "The service could not complete the request. Please try again later."
            }
            ErrorCode::NotFound => "The requested item could not be found.",
            ErrorCode::ConfigError => "The application is misconfigured. Please contact support.",
            ErrorCode::UnknownError => "An unexpected error occurred. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STORAGE_ERROR" => Ok(ErrorCode::StorageError),
            "STORAGE_QUOTA_EXCEEDED" => Ok(ErrorCode::StorageQuotaExceeded),
            "STORAGE_UNAVAILABLE" => Ok(ErrorCode::StorageUnavailable),
            "VALIDATION_ERROR" => Ok(ErrorCode::ValidationError),
            "NETWORK_ERROR" => Ok(ErrorCode::NetworkError),
            "API_ERROR" => Ok(ErrorCode::ApiError),
            "NOT_FOUND" => Ok(ErrorCode::NotFound),
            "CONFIG_ERROR" => Ok(ErrorCode::ConfigError),
            "UNKNOWN_ERROR" => Ok(ErrorCode::UnknownError),
            _ => Err(format!("Unknown error code: {}", s)),
        }
    }
}

/// The closed set of failure kinds, with kind-specific context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    StorageQuotaExceeded,
    StorageUnavailable,
    Validation {
        field: Option<String>,
    },
    Network,
    Api {
        status_code: u16,
    },
    NotFound {
        resource_type: String,
        resource_id: String,
    },
    Config,
    Unknown,
}

impl ErrorKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            ErrorKind::Storage => ErrorCode::StorageError,
            ErrorKind::StorageQuotaExceeded => ErrorCode::StorageQuotaExceeded,
            ErrorKind::StorageUnavailable => ErrorCode::StorageUnavailable,
            ErrorKind::Validation { .. } => ErrorCode::ValidationError,
            ErrorKind::Network => ErrorCode::NetworkError,
            ErrorKind::Api { .. } => ErrorCode::ApiError,
            ErrorKind::NotFound { .. } => ErrorCode::NotFound,
            ErrorKind::Config => ErrorCode::ConfigError,
            ErrorKind::Unknown => ErrorCode::UnknownError,
        }
    }
}

/// Root of the error taxonomy.
///
/// `user_message` is safe to show in the UI. `message`, `Debug` output and the
/// wrapped cause are meant for logs only.
#[derive(Clone)]
pub struct AppError {
    kind: ErrorKind,
    message: String,
    user_message: String,
    retryable: bool,
    cause: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl AppError {
    fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        let user_message = kind.code().default_user_message().to_string();
        Self {
            kind,
            message: message.into(),
            user_message,
            retryable,
            cause: None,
        }
    }

    /// Generic persistence failure. Retryable unless overridden.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message, true)
    }

    pub fn storage_quota_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageQuotaExceeded, message, false)
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageUnavailable, message, false)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation { field: None }, message, false)
    }

    /// Validation failure attributed to a specific input field.
    pub fn validation_for(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Validation {
                field: Some(field.into()),
            },
            message,
            false,
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message, true)
    }

    /// Upstream API failure; only server-side (5xx) statuses are retryable.
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Api { status_code }, message, status_code >= 500)
    }

    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let message = format!("{} not found: {}", resource_type, resource_id);
        let mut error = Self::new(
            ErrorKind::NotFound {
                resource_type: resource_type.clone(),
                resource_id,
            },
            message,
            false,
        );
        error.user_message = format!("The requested {} could not be found.", resource_type);
        error
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message, false)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message, false)
    }

    pub fn with_user_message(mut self, user_message: impl Into<String>) -> Self {
        self.user_message = user_message.into();
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    fn with_boxed_cause(mut self, cause: BoxError) -> Self {
        self.cause = Some(Arc::from(cause));
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Offending field for validation errors.
    pub fn field(&self) -> Option<&str> {
        match &self.kind {
            ErrorKind::Validation { field } => field.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.kind {
            ErrorKind::Api { status_code } => Some(*status_code),
            _ => None,
        }
    }

    /// The wrapped native error, if any.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }
}

impl fmt::Debug for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppError")
            .field("code", &self.code())
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("retryable", &self.retryable)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Normalizes any error into an [`AppError`].
///
/// Total and deterministic: an `AppError` passes through unchanged, anything else is
/// classified by the tokens in its text and kept as the cause.
pub fn to_app_error<E>(error: E) -> AppError
where
    E: Into<BoxError>,
{
    let boxed: BoxError = error.into();
    let boxed = match boxed.downcast::<AppError>() {
        Ok(app) => return *app,
        Err(other) => other,
    };

    let message = boxed.to_string();
    let haystack = format!("{} {:?}", message, boxed).to_lowercase();

    let classified = if QUOTA_TOKENS.iter().any(|t| haystack.contains(t)) {
        AppError::storage_quota_exceeded(message)
    } else if STORAGE_TOKENS.iter().any(|t| haystack.contains(t)) {
        AppError::storage(message)
    } else {
        AppError::unknown(message)
    };

    classified.with_boxed_cause(boxed)
}

/// True only for `AppError`s flagged retryable.
pub fn is_retryable_error(error: &(dyn StdError + 'static)) -> bool {
    error
        .downcast_ref::<AppError>()
        .map(AppError::is_retryable)
        .unwrap_or(false)
}

pub fn user_message_of(error: Option<&(dyn StdError + 'static)>) -> String {
    match error.and_then(|e| e.downcast_ref::<AppError>()) {
        Some(app) => app.user_message().to_string(),
        None => ErrorCode::UnknownError.default_user_message().to_string(),
    }
}

pub fn error_code_of(error: Option<&(dyn StdError + 'static)>) -> ErrorCode {
    error
        .and_then(|e| e.downcast_ref::<AppError>())
        .map(AppError::code)
        .unwrap_or(ErrorCode::UnknownError)
}
