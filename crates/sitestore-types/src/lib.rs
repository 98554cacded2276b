//! Sitestore Types
//!
//! Shared vocabulary for the storage subsystem:
//! - the closed error taxonomy every storage failure is normalized into
//! - the persisted document model and its partial-update patch
//! - the validated site content schema

mod content;
mod document;
mod error;

pub use content::{
    Block, CallToActionBlock, FeatureItem, FeaturesBlock, FooterBlock, FooterLink, HeroBlock,
    ImageBlock, SiteConfig, TextBlock,
};
pub use document::{Document, DocumentPatch};
pub use error::{
    error_code_of, is_retryable_error, to_app_error, user_message_of, AppError, BoxError,
    ErrorCode, ErrorKind,
};

pub type Result<T> = std::result::Result<T, AppError>;
