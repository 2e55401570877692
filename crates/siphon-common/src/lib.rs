//! Siphon Common Library
//!
//! Shared types and utilities for the siphon workspace:
//!
//! - **Error Handling**: the `SiphonError` taxonomy and `Result` alias
//! - **Logging**: centralized `tracing` setup for all binaries
//! - **Cleaning**: deep-clean utilities for JSON documents

pub mod clean;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SiphonError};
