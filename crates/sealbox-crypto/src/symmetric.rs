//! Authenticated symmetric encryption
//!
//! XChaCha20-Poly1305 with 32-byte keys and 24-byte random nonces. The
//! extended nonce makes random nonce collisions negligible, so nonces are
//! drawn fresh per call and never tracked.
//!
//! Decryption fails closed: a tag mismatch returns an error and no
//! plaintext, partial or otherwise.

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use tracing::trace;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding;
use crate::error::{CryptoError, CryptoResult};
use crate::random::{KeySource, random_array};

/// Key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Nonce size for XChaCha20-Poly1305 (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// A 256-bit symmetric key, zeroized on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a new random key
    pub fn generate(source: &dyn KeySource) -> Self {
        Self(random_array(source))
    }

    /// Create from raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    /// Get the raw key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// A 192-bit XChaCha20 nonce
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Draw a fresh random nonce
    pub fn generate(source: &dyn KeySource) -> Self {
        Self(random_array(source))
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let nonce: [u8; NONCE_SIZE] = bytes.try_into().map_err(|_| CryptoError::InvalidNonce)?;
        Ok(Self(nonce))
    }

    /// Get the raw nonce bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..6]))
    }
}

impl Serialize for Nonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encoding::base64_bytes::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Nonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = encoding::base64_bytes::deserialize(deserializer)?;
        Nonce::from_slice(&bytes).map_err(D::Error::custom)
    }
}

/// Output of one encryption call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with the authentication tag appended
    pub ciphertext: Vec<u8>,
    /// Nonce the ciphertext was produced under
    pub nonce: Nonce,
}

impl Sealed {
    /// Convert to bytes (nonce || ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(self.nonce.as_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Parse from bytes (nonce || ciphertext)
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DataTooShort {
                expected: NONCE_SIZE + TAG_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            nonce: Nonce::from_slice(&data[..NONCE_SIZE])?,
            ciphertext: data[NONCE_SIZE..].to_vec(),
        })
    }
}

/// Encrypt `plaintext` under `key`.
///
/// A caller-supplied nonce is used as-is; otherwise a fresh one is drawn
/// from `source`. Supplying a nonce is for fixtures only: reusing one
/// under the same key breaks confidentiality.
pub fn encrypt_symmetric(
    plaintext: &[u8],
    key: &SymmetricKey,
    nonce: Option<Nonce>,
    source: &dyn KeySource,
) -> CryptoResult<Sealed> {
    let nonce = nonce.unwrap_or_else(|| Nonce::generate(source));

    let ciphertext = key
        .cipher()
        .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    trace!(len = plaintext.len(), "Sealed symmetric payload");
    Ok(Sealed { ciphertext, nonce })
}

/// Decrypt and authenticate `ciphertext`.
///
/// Returns [`CryptoError::DecryptionFailed`] on any tag mismatch.
pub fn decrypt_symmetric(ciphertext: &[u8], key: &SymmetricKey, nonce: &Nonce) -> CryptoResult<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DataTooShort {
            expected: TAG_SIZE,
            actual: ciphertext.len(),
        });
    }

    key.cipher()
        .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed("authentication tag mismatch".to_string()))
}
