//! Error types for siphon

use thiserror::Error;

/// Result type alias for siphon operations
pub type Result<T> = std::result::Result<T, SiphonError>;

/// Main error type for siphon
///
/// Only per-record processing failures are ever recovered from; every other
/// variant bubbles to the top-level result and aborts the run.
#[derive(Error, Debug)]
pub enum SiphonError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Bookkeeping write failed: {0}")]
    Bookkeeping(String),

    #[error("Cursor exceeded max execution time of {0} ms")]
    CursorTimeout(u64),

    #[error("Unsupported pipeline stage: {0}")]
    UnsupportedStage(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),
}
