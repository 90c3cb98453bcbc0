//! Persisted ciphertext records
//!
//! Two shapes exist in storage:
//!
//! - [`EncryptedMetadata`] `{ciphertext, nonce}`: sealed under an already
//!   high-entropy key (a resource key or device key), so no salt.
//! - [`LegacyCiphertext`] `{ciphertext, salt, nonce}`: sealed under a key
//!   derived from a passphrase or credential with Argon2id. Data written by
//!   the old password-only scheme has this shape, and so do passphrase-sealed
//!   private keys.
//!
//! The presence of `salt` is what tells them apart; see [`crate::migration`].

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{KdfParams, Salt, derive_key};
use crate::random::KeySource;
use crate::symmetric::{Nonce, SymmetricKey, decrypt_symmetric, encrypt_symmetric};

/// A short field sealed under a high-entropy key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncryptedMetadata {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

impl EncryptedMetadata {
    /// Encrypt `plaintext` under `key` with a fresh nonce
    pub fn seal(plaintext: &[u8], key: &SymmetricKey, source: &dyn KeySource) -> CryptoResult<Self> {
        let sealed = encrypt_symmetric(plaintext, key, None, source)?;
        Ok(Self {
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
        })
    }

    /// Decrypt with `key`, failing closed on tag mismatch
    pub fn open(&self, key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
        decrypt_symmetric(&self.ciphertext, key, &self.nonce)
    }
}

/// A value sealed under a passphrase-derived key
///
/// The KDF cost parameters are not part of the record. Readers must know
/// which parameters the writer used.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LegacyCiphertext {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub salt: Vec<u8>,
    pub nonce: Nonce,
}

impl LegacyCiphertext {
    /// Derive a key from `secret` under a fresh salt and seal `plaintext`
    pub fn seal(
        plaintext: &[u8],
        secret: &[u8],
        params: &KdfParams,
        source: &dyn KeySource,
    ) -> CryptoResult<Self> {
        let salt = Salt::generate(source);
        let key = derive_key(secret, &salt, params)?;
        let sealed = encrypt_symmetric(plaintext, &key, None, source)?;

        trace!(len = plaintext.len(), "Sealed value under derived key");
        Ok(Self {
            ciphertext: sealed.ciphertext,
            salt: salt.as_bytes().to_vec(),
            nonce: sealed.nonce,
        })
    }

    /// Re-derive the key from `secret` and decrypt.
    ///
    /// A wrong secret and a tampered record are indistinguishable here; both
    /// return [`CryptoError::Authentication`].
    pub fn open(&self, secret: &[u8], params: &KdfParams) -> CryptoResult<Vec<u8>> {
        let salt = Salt::from_slice(&self.salt)?;
        let key = derive_key(secret, &salt, params)?;
        decrypt_symmetric(&self.ciphertext, &key, &self.nonce).map_err(|_| CryptoError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::OsKeySource;

    #[test]
    fn test_metadata_roundtrip() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);

        let sealed = EncryptedMetadata::seal(b"quarterly-report.pdf", &key, &source).unwrap();
        assert_eq!(sealed.open(&key).unwrap(), b"quarterly-report.pdf");

        let other = SymmetricKey::generate(&source);
        assert!(sealed.open(&other).is_err());
    }

    #[test]
    fn test_metadata_json_shape() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);
        let sealed = EncryptedMetadata::seal(b"12 KB", &key, &source).unwrap();

        let json = serde_json::to_value(&sealed).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj["ciphertext"].is_string());
        assert!(obj["nonce"].is_string());

        let back: EncryptedMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn test_legacy_roundtrip_and_wrong_secret() {
        let source = OsKeySource;
        let params = KdfParams::testing();

        let sealed = LegacyCiphertext::seal(b"old data", b"hunter2", &params, &source).unwrap();
        assert_eq!(sealed.salt.len(), crate::kdf::SALT_SIZE);
        assert_eq!(sealed.open(b"hunter2", &params).unwrap(), b"old data");

        let result = sealed.open(b"hunter3", &params);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_legacy_fresh_salt_per_seal() {
        let source = OsKeySource;
        let params = KdfParams::testing();
        let a = LegacyCiphertext::seal(b"x", b"pw", &params, &source).unwrap();
        let b = LegacyCiphertext::seal(b"x", b"pw", &params, &source).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn test_legacy_json_shape() {
        let source = OsKeySource;
        let sealed = LegacyCiphertext::seal(b"x", b"pw", &KdfParams::testing(), &source).unwrap();
        let json = serde_json::to_value(&sealed).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert!(obj.contains_key("salt"));

        // The unsalted shape must not accept a salted record
        assert!(serde_json::from_value::<EncryptedMetadata>(json).is_err());
    }
}
