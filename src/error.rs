//! Error types for the gene normalizer.
//!
//! All errors are strongly typed using thiserror. Storage failures live in
//! [`crate::storage::StorageError`] and merge failures in
//! [`crate::merge::MergeError`]; this module holds record validation errors
//! and the top-level [`NormalizerError`] that wraps everything a caller can
//! see.

use thiserror::Error;

use crate::merge::MergeError;
use crate::storage::StorageError;

/// Validation errors raised while accepting a record from a source loader.
///
/// A validation failure rejects only the offending record; the rest of the
/// load proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: &'static str,
    },

    #[error("Field '{field}' cannot be empty")]
    EmptyField {
        field: &'static str,
    },

    #[error("'{value}' is not a valid CURIE")]
    InvalidCurie {
        value: String,
    },

    #[error("Concept ID '{concept_id}' does not belong to the '{expected}' namespace")]
    NamespaceMismatch {
        concept_id: String,
        expected: &'static str,
    },

    #[error("Invalid location: {reason}")]
    InvalidLocation {
        reason: String,
    },

    #[error("Unknown source '{value}'")]
    UnknownSource {
        value: String,
    },

    #[error("Source priority must rank every source exactly once: {reason}")]
    InvalidPriority {
        reason: String,
    },
}

/// Top-level error type for the gene normalizer.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Merge error: {0}")]
    Merge(#[from] MergeError),

    #[error("Invalid parameter: {message}")]
    InvalidParameter {
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
    },

    #[error("I/O error on {path}: {message}")]
    Io {
        path: String,
        message: String,
    },
}

impl NormalizerError {
    /// Creates an invalid parameter error.
    #[must_use]
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an I/O error for `path`.
    #[must_use]
    pub fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if the backend could not be reached.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::Connection(_))
                | Self::Merge(MergeError::Storage(StorageError::Connection(_)))
        )
    }

    /// Returns true if a load or merge was aborted by a constraint violation.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::Storage(StorageError::Integrity(_))
                | Self::Merge(MergeError::Storage(StorageError::Integrity(_)))
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_retryable(),
            Self::Merge(e) => match e {
                MergeError::AlreadyRunning | MergeError::RecordsChanged(_) => true,
                MergeError::Storage(inner) => inner.is_retryable(),
                _ => false,
            },
            Self::Validation(_) | Self::InvalidParameter { .. } | Self::Config { .. } | Self::Io { .. } => false,
        }
    }
}

/// Result type alias for normalizer operations.
pub type NormalizerResult<T> = Result<T, NormalizerError>;
