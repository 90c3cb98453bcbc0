//! Error types for sealbox-access

use thiserror::Error;

use sealbox_core::{ResourceId, ResourceKind, StoreError, UserId};
use sealbox_crypto::CryptoError;

/// Errors raised by resource, rekeying and conversation operations
#[derive(Debug, Error)]
pub enum AccessError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Resource not found: {kind} {id}")]
    ResourceNotFound { kind: ResourceKind, id: ResourceId },

    /// The user holds no wrap, so per-member state cannot be attached.
    #[error("User {user} is not a member of this resource")]
    NotAMember { user: UserId },

    #[error("No public key registered for user {0}")]
    UnknownUser(UserId),

    #[error("Operation not permitted: {0}")]
    PermissionDenied(String),

    /// Conditional writes kept losing to concurrent writers.
    #[error("Gave up after {attempts} conflicting update attempts")]
    UpdateContention { attempts: u32 },

    #[error("Invalid resource record: {0}")]
    InvalidRecord(String),

    #[error("Operation not supported for {0} resources")]
    UnsupportedKind(ResourceKind),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AccessError {
    /// Create a new InvalidRecord error
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Whether the caller holds no wrap for the resource
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::AccessDenied { .. }) | Self::NotAMember { .. }
        )
    }

    /// Whether this failure may indicate tampering
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_integrity_failure())
    }

    /// Only transient storage failures and lost update races may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::UpdateContention { .. } => true,
            _ => false,
        }
    }

    /// A conditional write lost to a concurrent writer: a revision moved
    /// on, or a document claimed by sequence number already exists.
    pub(crate) fn is_lost_race(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::RevisionConflict { .. } | StoreError::AlreadyExists(_))
        )
    }
}

/// Result type for access operations
pub type AccessResult<T> = Result<T, AccessError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sealbox_core::Revision;

    #[test]
    fn test_access_denied_classification() {
        let denied: AccessError = CryptoError::AccessDenied {
            user: UserId::new("bob"),
        }
        .into();
        assert!(denied.is_access_denied());
        assert!(!denied.is_retryable());

        let not_member = AccessError::NotAMember {
            user: UserId::new("bob"),
        };
        assert!(not_member.is_access_denied());
    }

    #[test]
    fn test_retry_classification() {
        let conflict: AccessError = StoreError::RevisionConflict {
            expected: Revision(1),
            actual: Revision(2),
        }
        .into();
        assert!(conflict.is_retryable());
        assert!(conflict.is_lost_race());
        assert!(AccessError::from(StoreError::AlreadyExists("m/1".into())).is_lost_race());

        assert!(AccessError::UpdateContention { attempts: 3 }.is_retryable());
        assert!(AccessError::from(StoreError::Io("disk".into())).is_retryable());
        assert!(!AccessError::from(StoreError::not_found("x")).is_retryable());
        assert!(!AccessError::from(CryptoError::corruption("tag")).is_retryable());
    }

    #[test]
    fn test_integrity_classification() {
        assert!(AccessError::from(CryptoError::corruption("tag")).is_integrity_failure());
        assert!(!AccessError::from(CryptoError::Authentication).is_integrity_failure());
    }

    #[test]
    fn test_display() {
        let err = AccessError::ResourceNotFound {
            kind: ResourceKind::Group,
            id: ResourceId::new("g1"),
        };
        let msg = err.to_string();
        assert!(msg.contains("g1"));

        let err = AccessError::UpdateContention { attempts: 5 };
        assert!(err.to_string().contains('5'));
    }
}
