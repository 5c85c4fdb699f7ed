//! Error taxonomy for the retrieval pipeline.
//!
//! Every fallible core operation returns [`RagError`]. Callers branch on
//! [`RagError::kind`] rather than on message text:
//!
//! | Kind | Scope | Retry? |
//! |------|-------|--------|
//! | `UnsupportedMediaType` | document | no |
//! | `ExtractionError` | document | no |
//! | `EmbeddingError` | document | no |
//! | `ValidationError` | document / request | no |
//! | `Cancelled` | document | no |
//! | `DimensionMismatch` | index | no, operator fix required |
//! | `IndexUnavailable` | index | yes, with backoff |
//!
//! Document-scoped errors are recorded on the document's status and never
//! abort sibling documents. Index-scoped errors abort the current operation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RagError {
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("dimension mismatch: index expects {expected} dims, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The index was built with a different embedding model than the one
    /// now configured. Same operator remedy as a dimension mismatch.
    #[error("model mismatch: index built with '{expected}', configured '{actual}'")]
    ModelMismatch { expected: String, actual: String },

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("cancelled")]
    Cancelled,
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, RagError>;

/// Stable, storable classification of a [`RagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    UnsupportedMediaType,
    ExtractionError,
    EmbeddingError,
    DimensionMismatch,
    IndexUnavailable,
    ValidationError,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnsupportedMediaType => "UnsupportedMediaType",
            ErrorKind::ExtractionError => "ExtractionError",
            ErrorKind::EmbeddingError => "EmbeddingError",
            ErrorKind::DimensionMismatch => "DimensionMismatch",
            ErrorKind::IndexUnavailable => "IndexUnavailable",
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UnsupportedMediaType" => Ok(ErrorKind::UnsupportedMediaType),
            "ExtractionError" => Ok(ErrorKind::ExtractionError),
            "EmbeddingError" => Ok(ErrorKind::EmbeddingError),
            "DimensionMismatch" => Ok(ErrorKind::DimensionMismatch),
            "IndexUnavailable" => Ok(ErrorKind::IndexUnavailable),
            "ValidationError" => Ok(ErrorKind::ValidationError),
            "Cancelled" => Ok(ErrorKind::Cancelled),
            other => Err(RagError::Validation(format!("unknown error kind: {}", other))),
        }
    }
}

impl RagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RagError::UnsupportedMediaType(_) => ErrorKind::UnsupportedMediaType,
            RagError::Extraction(_) => ErrorKind::ExtractionError,
            RagError::Embedding(_) => ErrorKind::EmbeddingError,
            RagError::DimensionMismatch { .. } | RagError::ModelMismatch { .. } => {
                ErrorKind::DimensionMismatch
            }
            RagError::IndexUnavailable(_) => ErrorKind::IndexUnavailable,
            RagError::Validation(_) => ErrorKind::ValidationError,
            RagError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Only transient storage failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RagError::IndexUnavailable(_))
    }

    /// True when the failure belongs to the index itself rather than to the
    /// document being processed.
    pub fn is_index_scoped(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IndexUnavailable | ErrorKind::DimensionMismatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            RagError::Extraction("bad pdf".into()).kind(),
            ErrorKind::ExtractionError
        );
        assert_eq!(
            RagError::ModelMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .kind(),
            ErrorKind::DimensionMismatch
        );
    }

    #[test]
    fn test_only_index_unavailable_is_retryable() {
        assert!(RagError::IndexUnavailable("locked".into()).is_retryable());
        assert!(!RagError::DimensionMismatch {
            expected: 768,
            actual: 384
        }
        .is_retryable());
        assert!(!RagError::Embedding("empty".into()).is_retryable());
    }

    #[test]
    fn test_index_scope() {
        assert!(RagError::IndexUnavailable("x".into()).is_index_scoped());
        assert!(RagError::DimensionMismatch {
            expected: 2,
            actual: 3
        }
        .is_index_scoped());
        assert!(!RagError::Validation("x".into()).is_index_scoped());
    }

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            ErrorKind::UnsupportedMediaType,
            ErrorKind::ExtractionError,
            ErrorKind::EmbeddingError,
            ErrorKind::DimensionMismatch,
            ErrorKind::IndexUnavailable,
            ErrorKind::ValidationError,
            ErrorKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<ErrorKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_display() {
        let err = RagError::DimensionMismatch {
            expected: 768,
            actual: 384,
        };
        assert_eq!(
            err.to_string(),
            "dimension mismatch: index expects 768 dims, got 384"
        );
    }
}
