//! Legacy format detection and transparent decryption
//!
//! Stored ciphertexts come in two shapes. A `salt` next to the `nonce`
//! marks the old passphrase-derived format; a bare `nonce` marks the
//! envelope format sealed under a resource key. The shape is inspected
//! once, when a JSON value crosses the storage boundary, and becomes a
//! [`SealedValue`] variant. Nothing downstream looks at field names again.
//!
//! # Example
//!
//! ```rust,ignore
//! let value = SealedValue::from_json(&stored)?;
//! let adapter = MigrationAdapter::new(KdfParams::default());
//! let plaintext = adapter.decrypt_any(&value, &DecryptionContext::with_key(key))?;
//! ```

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{KdfParams, normalize_passphrase};
use crate::metadata::{EncryptedMetadata, LegacyCiphertext};
use crate::random::KeySource;
use crate::secure_bytes::SecureBytes;
use crate::symmetric::SymmetricKey;

/// Text shown in place of a value that could not be decrypted
pub const ENCRYPTED_PLACEHOLDER: &str = "[Encrypted]";

/// A stored ciphertext, classified by shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SealedValue {
    /// `{ciphertext, salt, nonce}`: key derived from a passphrase
    Legacy(LegacyCiphertext),
    /// `{ciphertext, nonce}`: sealed under a high-entropy key
    Envelope(EncryptedMetadata),
}

impl SealedValue {
    /// Classify a stored JSON value.
    ///
    /// Anything that is not an object with a `nonce` is a
    /// [`CryptoError::Format`] error, including a `salt` with no `nonce`.
    pub fn from_json(value: &Value) -> CryptoResult<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| CryptoError::format("sealed value is not an object"))?;

        let has_nonce = obj.contains_key("nonce");
        let has_salt = obj.contains_key("salt");

        match (has_salt, has_nonce) {
            (true, true) => serde_json::from_value(value.clone())
                .map(Self::Legacy)
                .map_err(|e| CryptoError::format(format!("malformed legacy ciphertext: {}", e))),
            (false, true) => serde_json::from_value(value.clone())
                .map(Self::Envelope)
                .map_err(|e| CryptoError::format(format!("malformed envelope ciphertext: {}", e))),
            (true, false) => Err(CryptoError::format("salt present without nonce")),
            (false, false) => Err(CryptoError::format("no nonce field")),
        }
    }

    /// Serialize back to the stored JSON shape
    pub fn to_json(&self) -> CryptoResult<Value> {
        serde_json::to_value(self).map_err(|e| CryptoError::format(e.to_string()))
    }

    /// Whether this value still uses the passphrase-derived format
    pub fn is_legacy(&self) -> bool {
        matches!(self, Self::Legacy(_))
    }
}

impl From<EncryptedMetadata> for SealedValue {
    fn from(value: EncryptedMetadata) -> Self {
        Self::Envelope(value)
    }
}

impl From<LegacyCiphertext> for SealedValue {
    fn from(value: LegacyCiphertext) -> Self {
        Self::Legacy(value)
    }
}

impl<'de> Deserialize<'de> for SealedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        SealedValue::from_json(&value).map_err(D::Error::custom)
    }
}

/// The secrets a caller can offer for decryption
#[derive(Default)]
pub struct DecryptionContext {
    passphrase: Option<SecureBytes>,
    key: Option<SymmetricKey>,
}

impl DecryptionContext {
    /// Context holding only a resource (or device) key
    pub fn with_key(key: SymmetricKey) -> Self {
        Self {
            passphrase: None,
            key: Some(key),
        }
    }

    /// Context holding only a passphrase
    pub fn with_passphrase(passphrase: &str) -> Self {
        Self {
            passphrase: Some(normalize_passphrase(passphrase)),
            key: None,
        }
    }

    /// Context holding raw low-entropy secret bytes (e.g. a credential id)
    pub fn with_secret(secret: &[u8]) -> Self {
        Self {
            passphrase: Some(SecureBytes::new(secret.to_vec())),
            key: None,
        }
    }

    /// Add a passphrase to this context
    pub fn and_passphrase(mut self, passphrase: &str) -> Self {
        self.passphrase = Some(normalize_passphrase(passphrase));
        self
    }

    /// Add a key to this context
    pub fn and_key(mut self, key: SymmetricKey) -> Self {
        self.key = Some(key);
        self
    }
}

impl std::fmt::Debug for DecryptionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionContext")
            .field("has_passphrase", &self.passphrase.is_some())
            .field("has_key", &self.key.is_some())
            .finish()
    }
}

/// Routes each [`SealedValue`] to the right decryption path
#[derive(Debug, Clone)]
pub struct MigrationAdapter {
    legacy_kdf: KdfParams,
}

impl MigrationAdapter {
    /// Create an adapter that reads legacy values written with `legacy_kdf`
    pub fn new(legacy_kdf: KdfParams) -> Self {
        Self { legacy_kdf }
    }

    /// KDF parameters used for the legacy path
    pub fn legacy_kdf(&self) -> &KdfParams {
        &self.legacy_kdf
    }

    /// Decrypt either shape.
    ///
    /// - Legacy: Argon2id over the passphrase, then AEAD. Failure is
    ///   [`CryptoError::Authentication`].
    /// - Envelope: AEAD under the key directly. Failure is
    ///   [`CryptoError::Corruption`], since a correct key was expected.
    pub fn decrypt_any(&self, value: &SealedValue, context: &DecryptionContext) -> CryptoResult<Vec<u8>> {
        match value {
            SealedValue::Legacy(legacy) => {
                let passphrase = context
                    .passphrase
                    .as_ref()
                    .ok_or(CryptoError::MissingSecret("passphrase"))?;
                debug!("Decrypting legacy passphrase-derived value");
                legacy.open(passphrase.as_slice(), &self.legacy_kdf)
            }
            SealedValue::Envelope(metadata) => {
                let key = context.key.as_ref().ok_or(CryptoError::MissingSecret("key"))?;
                metadata
                    .open(key)
                    .map_err(|e| CryptoError::corruption(format!("envelope value did not authenticate: {}", e)))
            }
        }
    }

    /// Classify a raw JSON value and decrypt it
    pub fn decrypt_json(&self, value: &Value, context: &DecryptionContext) -> CryptoResult<Vec<u8>> {
        let sealed = SealedValue::from_json(value)?;
        self.decrypt_any(&sealed, context)
    }

    /// Decrypt many values. One bad value never aborts the rest.
    pub fn decrypt_batch(&self, values: &[Value], context: &DecryptionContext) -> Vec<CryptoResult<Vec<u8>>> {
        values
            .iter()
            .map(|value| self.decrypt_json(value, context))
            .collect()
    }

    /// Re-encrypt a legacy value into the envelope shape under `key`.
    ///
    /// Returns `None` when the value is already in envelope shape.
    pub fn upgrade(
        &self,
        value: &SealedValue,
        context: &DecryptionContext,
        key: &SymmetricKey,
        source: &dyn KeySource,
    ) -> CryptoResult<Option<EncryptedMetadata>> {
        match value {
            SealedValue::Envelope(_) => Ok(None),
            SealedValue::Legacy(_) => {
                let plaintext = SecureBytes::new(self.decrypt_any(value, context)?);
                let upgraded = EncryptedMetadata::seal(plaintext.as_slice(), key, source)?;
                debug!("Upgraded legacy value to envelope format");
                Ok(Some(upgraded))
            }
        }
    }
}

/// UI-facing boundary: show plaintext, or a placeholder on failure.
///
/// The error is logged, never dropped. Callers that know which resource
/// and user were involved record integrity failures in the audit trail
/// before getting here.
pub fn display_or_placeholder(result: CryptoResult<Vec<u8>>, field: &str) -> String {
    match result {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!(field, "Decrypted value is not valid UTF-8");
                ENCRYPTED_PLACEHOLDER.to_string()
            }
        },
        Err(e) => {
            warn!(field, error = %e, "Showing placeholder for undecryptable value");
            ENCRYPTED_PLACEHOLDER.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::OsKeySource;
    use serde_json::json;

    fn adapter() -> MigrationAdapter {
        MigrationAdapter::new(KdfParams::testing())
    }

    #[test]
    fn test_classify_shapes() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);

        let envelope = EncryptedMetadata::seal(b"new", &key, &source).unwrap();
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(matches!(SealedValue::from_json(&value), Ok(SealedValue::Envelope(_))));

        let legacy = LegacyCiphertext::seal(b"old", b"pw", &KdfParams::testing(), &source).unwrap();
        let value = serde_json::to_value(&legacy).unwrap();
        let classified = SealedValue::from_json(&value).unwrap();
        assert!(classified.is_legacy());

        // Serializing a classified value reproduces the stored shape
        assert_eq!(classified.to_json().unwrap(), value);
    }

    #[test]
    fn test_unrecognized_shapes_are_format_errors() {
        let cases = [
            json!("just a string"),
            json!({"ciphertext": "AAAA"}),
            json!({"ciphertext": "AAAA", "salt": "AAAA"}),
            json!({"ciphertext": "AAAA", "nonce": "short"}),
            json!(null),
        ];
        for case in cases {
            let result = SealedValue::from_json(&case);
            assert!(matches!(result, Err(CryptoError::Format(_))), "{case}");
        }
    }

    #[test]
    fn test_routes_legacy_through_kdf() {
        let source = OsKeySource;
        let legacy = LegacyCiphertext::seal(b"old secret", b"pw", &KdfParams::testing(), &source).unwrap();
        let value = SealedValue::Legacy(legacy);

        let good = adapter().decrypt_any(&value, &DecryptionContext::with_passphrase("pw"));
        assert_eq!(good.unwrap(), b"old secret");

        let bad = adapter().decrypt_any(&value, &DecryptionContext::with_passphrase("wrong"));
        assert!(matches!(bad, Err(CryptoError::Authentication)));

        // A key alone cannot open a legacy value
        let key = SymmetricKey::generate(&source);
        let missing = adapter().decrypt_any(&value, &DecryptionContext::with_key(key));
        assert!(matches!(missing, Err(CryptoError::MissingSecret(_))));
    }

    #[test]
    fn test_routes_envelope_directly() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);
        let value = SealedValue::Envelope(EncryptedMetadata::seal(b"new secret", &key, &source).unwrap());

        let good = adapter().decrypt_any(&value, &DecryptionContext::with_key(key.clone()));
        assert_eq!(good.unwrap(), b"new secret");

        let other = SymmetricKey::generate(&source);
        let bad = adapter().decrypt_any(&value, &DecryptionContext::with_key(other));
        assert!(matches!(bad, Err(CryptoError::Corruption(_))));

        let missing = adapter().decrypt_any(&value, &DecryptionContext::with_passphrase("pw"));
        assert!(matches!(missing, Err(CryptoError::MissingSecret(_))));
    }

    #[test]
    fn test_batch_isolates_failures() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);
        let values = vec![
            serde_json::to_value(EncryptedMetadata::seal(b"one", &key, &source).unwrap()).unwrap(),
            json!({"unexpected": true}),
            serde_json::to_value(EncryptedMetadata::seal(b"three", &key, &source).unwrap()).unwrap(),
        ];

        let results = adapter().decrypt_batch(&values, &DecryptionContext::with_key(key));
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap(), b"one");
        assert!(matches!(results[1], Err(CryptoError::Format(_))));
        assert_eq!(results[2].as_ref().unwrap(), b"three");
    }

    #[test]
    fn test_upgrade_legacy_to_envelope() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);
        let legacy = SealedValue::Legacy(
            LegacyCiphertext::seal(b"carry me over", b"pw", &KdfParams::testing(), &source).unwrap(),
        );
        let context = DecryptionContext::with_passphrase("pw").and_key(key.clone());

        let upgraded = adapter().upgrade(&legacy, &context, &key, &source).unwrap().unwrap();
        assert_eq!(upgraded.open(&key).unwrap(), b"carry me over");

        let envelope = SealedValue::Envelope(upgraded);
        assert!(adapter().upgrade(&envelope, &context, &key, &source).unwrap().is_none());
    }

    #[test]
    fn test_placeholder_only_on_failure() {
        assert_eq!(display_or_placeholder(Ok(b"Budget.xlsx".to_vec()), "name"), "Budget.xlsx");
        assert_eq!(
            display_or_placeholder(Err(CryptoError::corruption("bad tag")), "name"),
            ENCRYPTED_PLACEHOLDER
        );
        assert_eq!(display_or_placeholder(Ok(vec![0xff, 0xfe]), "name"), ENCRYPTED_PLACEHOLDER);
    }

    #[test]
    fn test_sealed_value_serde_roundtrip() {
        let source = OsKeySource;
        let key = SymmetricKey::generate(&source);
        let value: SealedValue = EncryptedMetadata::seal(b"x", &key, &source).unwrap().into();

        let text = serde_json::to_string(&value).unwrap();
        let back: SealedValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, value);

        assert!(serde_json::from_str::<SealedValue>(r#"{"salt":"AAAA"}"#).is_err());
    }
}
