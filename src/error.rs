//! Error types for relay-history.
//!
//! All errors are strongly typed using thiserror. The split mirrors the
//! failure classes of a synchronization run:
//!
//! - [`ValidationError`]: malformed input that can never be stored faithfully
//! - [`ExecutionError`]: engine-level failures while reconciling a snapshot
//! - [`StorageError`]: failures reported by the relational store collaborator
//!
//! Uniqueness conflicts (`StorageError::DuplicateKey`) are the only recoverable
//! class and are handled where they occur; everything that reaches a caller as
//! a [`HistoryError`] aborts the run.

use thiserror::Error;

pub use crate::storage::StorageError;

/// Validation errors raised while normalizing an incoming relay record.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing or empty")]
    MissingField {
        field: String,
    },

    #[error("Field '{field}' exceeds maximum length of {max_length} (got {actual})")]
    FieldTooLong {
        field: String,
        max_length: usize,
        actual: usize,
    },

    #[error("Invalid {role} address '{address}': {reason}")]
    InvalidAddress {
        role: String,
        address: String,
        reason: String,
    },

    #[error("Invalid country code '{code}'")]
    InvalidCountryCode {
        code: String,
    },

    #[error("Unable to parse timestamp from {candidates:?}")]
    InvalidTimestamp {
        candidates: Vec<String>,
    },

    #[error("Invalid timestamp pattern '{pattern}': {reason}")]
    InvalidTimestampPattern {
        pattern: String,
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while reconciling a snapshot.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: StorageError,
    },

    #[error("Duplicate {table} row for '{value}' reported but lookup found nothing")]
    DuplicateWithoutRow {
        table: String,
        value: String,
    },

    #[error("Country code '{code}' is not registered")]
    CountryNotRegistered {
        code: String,
    },

    #[error("Failed to serialize {field}: {message}")]
    Serialization {
        field: String,
        message: String,
    },
}

impl ExecutionError {
    /// Wraps a store failure with the operation that triggered it.
    #[must_use]
    pub fn storage(operation: impl Into<String>, source: StorageError) -> Self {
        Self::Storage {
            operation: operation.into(),
            source,
        }
    }
}

/// Top-level error type for relay-history.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl HistoryError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a bare storage error.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns the underlying store failure, if any.
    #[must_use]
    pub const fn storage_source(&self) -> Option<&StorageError> {
        match self {
            Self::Storage(e) | Self::Execution(ExecutionError::Storage { source: e, .. }) => {
                Some(e)
            }
            _ => None,
        }
    }

    /// Returns true if re-running the whole synchronization may succeed.
    ///
    /// Every node reconciliation is idempotent, so a run aborted by a lost
    /// connection can be repeated as-is. Malformed input fails the same way on
    /// every attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.storage_source() {
            Some(source) => source.is_connection(),
            None => false,
        }
    }
}

/// Result type alias for relay-history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;
