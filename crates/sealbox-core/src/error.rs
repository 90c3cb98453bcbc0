//! Error types for storage collaborators

use thiserror::Error;

use crate::ids::Revision;

/// Errors raised by document and blob stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A conditional write lost the race against another writer.
    #[error("Revision conflict: expected {expected}, found {actual}")]
    RevisionConflict { expected: Revision, actual: Revision },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    #[error("Storage capacity exceeded")]
    CapacityExceeded,

    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Create a new NotFound error
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    /// Create a new InvalidPatch error
    pub fn invalid_patch(message: impl Into<String>) -> Self {
        Self::InvalidPatch(message.into())
    }

    /// Whether the caller may retry the same operation.
    ///
    /// Only transient I/O and lost compare-and-swap races qualify; a
    /// conflict must be retried from a fresh read, never blindly.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::RevisionConflict { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::not_found("resources/abc");
        assert!(format!("{}", err).contains("resources/abc"));

        let err = StoreError::RevisionConflict {
            expected: Revision(3),
            actual: Revision(5),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 5"));
    }

    #[test]
    fn test_retryable() {
        assert!(StoreError::Io("disk".into()).is_retryable());
        assert!(
            StoreError::RevisionConflict {
                expected: Revision(1),
                actual: Revision(2)
            }
            .is_retryable()
        );
        assert!(!StoreError::not_found("x").is_retryable());
        assert!(!StoreError::CapacityExceeded.is_retryable());
    }
}
