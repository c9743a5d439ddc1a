//! Error types module
//!
//! Per-item failures are contained to the item that raised them: the batch
//! consumer converts every [`ItemError`] into a tracked job failure keyed by its
//! [`ErrorType`] and carries on with the sibling items. Batch-level failures are
//! plain `anyhow::Error`s and abort the whole batch.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like idempotent skips
    Debug,
    /// Warning level - for bad input that will never succeed
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Error category recorded in a job's per-error-type counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    ValidationFailure,
    TransientVisibilityFailure,
    GenerationFailure,
    DestinationFailure,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::ValidationFailure => "validation_failure",
            ErrorType::TransientVisibilityFailure => "transient_visibility_failure",
            ErrorType::GenerationFailure => "generation_failure",
            ErrorType::DestinationFailure => "destination_failure",
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ItemError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Source record not visible after {attempts} attempts: {message}")]
    TransientVisibility { attempts: u32, message: String },

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Destination write failed: {0}")]
    Destination(String),
}

impl ItemError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            ItemError::Validation(_) => ErrorType::ValidationFailure,
            ItemError::TransientVisibility { .. } => ErrorType::TransientVisibilityFailure,
            ItemError::Generation(_) => ErrorType::GenerationFailure,
            ItemError::Destination(_) => ErrorType::DestinationFailure,
        }
    }

    /// Validation failures are deterministic and never retried automatically.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ItemError::Validation(_))
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            ItemError::Validation(_) => LogLevel::Warn,
            ItemError::TransientVisibility { .. } => LogLevel::Warn,
            ItemError::Generation(_) | ItemError::Destination(_) => LogLevel::Error,
        }
    }
}
