//! Per-resource symmetric keys
//!
//! One [`ResourceKey`] is generated when a file, folder, group or
//! conversation is created. It is the only key that ever encrypts that
//! resource's content and metadata, and it is never stored directly:
//! only its per-recipient wraps are (see [`crate::envelope`]).

use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};
use crate::metadata::EncryptedMetadata;
use crate::random::KeySource;
use crate::symmetric::{KEY_SIZE, Sealed, SymmetricKey, decrypt_symmetric, encrypt_symmetric};

/// A 256-bit resource key, zeroized on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ResourceKey(SymmetricKey);

impl ResourceKey {
    /// Generate a fresh key for a new resource
    pub fn generate(source: &dyn KeySource) -> Self {
        Self(SymmetricKey::generate(source))
    }

    /// Rebuild from unwrapped key bytes
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        SymmetricKey::from_slice(bytes).map(Self)
    }

    /// Raw key bytes, for wrapping
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }

    /// The underlying symmetric key
    pub fn as_symmetric(&self) -> &SymmetricKey {
        &self.0
    }

    /// Encrypt a short text field (name, size string, message text)
    pub fn encrypt_metadata(&self, text: &str, source: &dyn KeySource) -> CryptoResult<EncryptedMetadata> {
        EncryptedMetadata::seal(text.as_bytes(), &self.0, source)
    }

    /// Decrypt a short text field.
    ///
    /// A tag mismatch is [`CryptoError::Corruption`]: whoever holds the
    /// resource key should always be able to read its fields.
    pub fn decrypt_metadata(&self, metadata: &EncryptedMetadata) -> CryptoResult<String> {
        let bytes = metadata
            .open(&self.0)
            .map_err(|e| CryptoError::corruption(format!("metadata did not authenticate: {}", e)))?;
        String::from_utf8(bytes).map_err(|_| CryptoError::corruption("metadata is not valid UTF-8"))
    }

    /// Seal a key this one replaced, so data still under it stays reachable
    pub fn seal_retired(&self, retired: &ResourceKey, source: &dyn KeySource) -> CryptoResult<EncryptedMetadata> {
        EncryptedMetadata::seal(retired.as_bytes(), &self.0, source)
    }

    /// Open a key sealed by [`Self::seal_retired`]
    pub fn open_retired(&self, sealed: &EncryptedMetadata) -> CryptoResult<ResourceKey> {
        let bytes = Zeroizing::new(
            sealed
                .open(&self.0)
                .map_err(|e| CryptoError::corruption(format!("retired key did not authenticate: {}", e)))?,
        );
        Self::from_slice(&bytes)
    }

    /// Encrypt bulk content into the blob layout `nonce || ciphertext`
    pub fn encrypt_content(&self, content: &[u8], source: &dyn KeySource) -> CryptoResult<Vec<u8>> {
        let sealed = encrypt_symmetric(content, &self.0, None, source)?;
        trace!(len = content.len(), "Encrypted content blob");
        Ok(sealed.to_bytes())
    }

    /// Decrypt a content blob produced by [`Self::encrypt_content`]
    pub fn decrypt_content(&self, blob: &[u8]) -> CryptoResult<Vec<u8>> {
        let sealed = Sealed::from_bytes(blob)?;
        decrypt_symmetric(&sealed.ciphertext, &self.0, &sealed.nonce)
            .map_err(|e| CryptoError::corruption(format!("content did not authenticate: {}", e)))
    }
}

impl std::fmt::Debug for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResourceKey(..)")
    }
}
