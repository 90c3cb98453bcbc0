//! Error types for sealbox-crypto

use thiserror::Error;

use sealbox_core::UserId;

/// Errors that can occur during cryptographic operations
///
/// The first four variants are the caller-facing taxonomy; the rest are
/// primitive failures that higher layers map onto it.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The principal holds no wrap for the resource.
    #[error("Access denied: no key wrap for user {user}")]
    AccessDenied { user: UserId },

    /// Wrong passphrase or unlock factor. Deliberately carries no detail.
    #[error("Authentication failed")]
    Authentication,

    /// Authenticated decryption failed on data that should have opened.
    #[error("Integrity check failed: {0}")]
    Corruption(String),

    /// A stored value matches no known ciphertext shape.
    #[error("Unrecognized ciphertext format: {0}")]
    Format(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid nonce")]
    InvalidNonce,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("PQ decapsulation failed: {0}")]
    PQDecapsulationFailed(String),

    #[error("Invalid PQ ciphertext: {0}")]
    InvalidPQCiphertext(String),

    #[error("Data too short: expected at least {expected} bytes, got {actual}")]
    DataTooShort { expected: usize, actual: usize },

    #[error("Missing secret: {0}")]
    MissingSecret(&'static str),
}

impl CryptoError {
    /// Create a new Corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// Create a new Format error
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Cryptographic failures are deterministic: the same inputs fail the
    /// same way, so nothing here is worth retrying.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Whether this failure may indicate tampering and belongs in the audit log
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
