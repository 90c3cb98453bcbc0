//! Multi-recipient key wrapping
//!
//! A resource is encrypted once under its [`ResourceKey`]. Access is
//! granted by wrapping that key separately for each recipient:
//!
//! ```text
//! for each recipient:
//!     (encapsulated, shared) = KEM.encapsulate(recipient.public_key)
//!     wrap = { encapsulated, AEAD(shared, fresh nonce, resource_key) }
//! ```
//!
//! Every encapsulation yields its own shared secret, which only ever
//! encrypts the resource key bytes inside that one wrap. Content and
//! metadata are always encrypted under the resource key itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use sealbox_core::UserId;

use crate::error::{CryptoError, CryptoResult};
use crate::pq_kem::{EncapsulatedKey, KemKeyPair, KemPublicKey};
use crate::random::KeySource;
use crate::resource_key::ResourceKey;
use crate::secure_bytes::SecureBytes;
use crate::symmetric::{Nonce, decrypt_symmetric, encrypt_symmetric};

/// A user the resource key is wrapped for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub user_id: UserId,
    pub public_key: KemPublicKey,
}

impl Recipient {
    pub fn new(user_id: impl Into<UserId>, public_key: KemPublicKey) -> Self {
        Self {
            user_id: user_id.into(),
            public_key,
        }
    }
}

/// One recipient's encrypted copy of a resource key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Wrap {
    pub encapsulated_key: EncapsulatedKey,
    pub nonce: Nonce,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl Wrap {
    /// Compact binary form
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| CryptoError::format(format!("wrap encoding failed: {}", e)))
    }

    /// Parse the compact binary form
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let wrap: Self =
            postcard::from_bytes(bytes).map_err(|e| CryptoError::format(format!("invalid wrap bytes: {}", e)))?;
        wrap.encapsulated_key.validate()?;
        Ok(wrap)
    }
}

/// The per-recipient wrap map of one resource
///
/// Ordered by user id so serialized envelopes are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope {
    wraps: BTreeMap<UserId, Wrap>,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a recipient's wrap
    pub fn get(&self, user: &UserId) -> Option<&Wrap> {
        self.wraps.get(user)
    }

    /// Whether `user` holds a wrap
    pub fn contains(&self, user: &UserId) -> bool {
        self.wraps.contains_key(user)
    }

    /// Insert or replace a wrap
    pub fn insert(&mut self, user: UserId, wrap: Wrap) -> Option<Wrap> {
        self.wraps.insert(user, wrap)
    }

    /// Remove a wrap
    pub fn remove(&mut self, user: &UserId) -> Option<Wrap> {
        self.wraps.remove(user)
    }

    /// Users holding a wrap, in order
    pub fn recipients(&self) -> impl Iterator<Item = &UserId> {
        self.wraps.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &Wrap)> {
        self.wraps.iter()
    }

    pub fn len(&self) -> usize {
        self.wraps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wraps.is_empty()
    }
}

impl FromIterator<(UserId, Wrap)> for Envelope {
    fn from_iter<I: IntoIterator<Item = (UserId, Wrap)>>(iter: I) -> Self {
        Self {
            wraps: iter.into_iter().collect(),
        }
    }
}

/// Wrap `key` for the holder of `public_key`
pub fn wrap_for(key: &ResourceKey, public_key: &KemPublicKey, source: &dyn KeySource) -> CryptoResult<Wrap> {
    let (encapsulated_key, shared) = public_key.encapsulate();
    let sealed = encrypt_symmetric(key.as_bytes(), &shared.as_wrap_key(), None, source)?;

    trace!(recipient = %public_key.fingerprint(), "Wrapped resource key");
    Ok(Wrap {
        encapsulated_key,
        nonce: sealed.nonce,
        ciphertext: sealed.ciphertext,
    })
}

/// Wrap `key` independently for every recipient
pub fn create_envelope(
    key: &ResourceKey,
    recipients: &[Recipient],
    source: &dyn KeySource,
) -> CryptoResult<Envelope> {
    let mut envelope = Envelope::new();
    for recipient in recipients {
        let wrap = wrap_for(key, &recipient.public_key, source)?;
        envelope.insert(recipient.user_id.clone(), wrap);
    }

    debug!(recipients = envelope.len(), "Created envelope");
    Ok(envelope)
}

/// Unwrap a single wrap with the recipient's key pair.
///
/// Kyber decapsulation with the wrong private key silently yields an
/// unrelated secret, so a mismatched or tampered wrap surfaces as
/// [`CryptoError::Corruption`] from the AEAD tag check.
pub fn open_wrap(wrap: &Wrap, keypair: &KemKeyPair) -> CryptoResult<ResourceKey> {
    wrap.encapsulated_key.validate()?;
    let shared = keypair.decapsulate(&wrap.encapsulated_key)?;

    let bytes = decrypt_symmetric(&wrap.ciphertext, &shared.as_wrap_key(), &wrap.nonce)
        .map(SecureBytes::new)
        .map_err(|e| CryptoError::corruption(format!("wrap did not authenticate: {}", e)))?;

    ResourceKey::from_slice(bytes.as_slice())
        .map_err(|_| CryptoError::corruption("unwrapped key has the wrong length"))
}

/// Recover the resource key for `user` from an envelope.
///
/// Fails with [`CryptoError::AccessDenied`] when `user` holds no wrap.
pub fn open_envelope(envelope: &Envelope, user: &UserId, keypair: &KemKeyPair) -> CryptoResult<ResourceKey> {
    let wrap = envelope
        .get(user)
        .ok_or_else(|| CryptoError::AccessDenied { user: user.clone() })?;
    open_wrap(wrap, keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::OsKeySource;

    struct Member {
        id: UserId,
        keys: KemKeyPair,
    }

    fn member(name: &str) -> Member {
        Member {
            id: UserId::new(name),
            keys: KemKeyPair::generate(),
        }
    }

    fn recipients(members: &[&Member]) -> Vec<Recipient> {
        members
            .iter()
            .map(|m| Recipient::new(m.id.clone(), m.keys.public_key()))
            .collect()
    }

    #[test]
    fn test_every_recipient_recovers_the_same_key() {
        let source = OsKeySource;
        let (a, b, c) = (member("a"), member("b"), member("c"));
        let key = ResourceKey::generate(&source);

        let envelope = create_envelope(&key, &recipients(&[&a, &b, &c]), &source).unwrap();
        assert_eq!(envelope.len(), 3);

        for m in [&a, &b, &c] {
            let opened = open_envelope(&envelope, &m.id, &m.keys).unwrap();
            assert_eq!(opened, key);
        }
    }

    #[test]
    fn test_wraps_are_independent() {
        let source = OsKeySource;
        let (a, b) = (member("a"), member("b"));
        let key = ResourceKey::generate(&source);
        let envelope = create_envelope(&key, &recipients(&[&a, &b]), &source).unwrap();

        let wa = envelope.get(&a.id).unwrap();
        let wb = envelope.get(&b.id).unwrap();
        assert_ne!(wa.encapsulated_key, wb.encapsulated_key);
        assert_ne!(wa.nonce, wb.nonce);
        assert_ne!(wa.ciphertext, wb.ciphertext);
    }

    #[test]
    fn test_isolation_between_recipients() {
        let source = OsKeySource;
        let (a, b) = (member("a"), member("b"));
        let key = ResourceKey::generate(&source);
        let envelope = create_envelope(&key, &recipients(&[&a, &b]), &source).unwrap();

        // B's private key against A's wrap never yields A's key
        let result = open_wrap(envelope.get(&a.id).unwrap(), &b.keys);
        assert!(matches!(result, Err(CryptoError::Corruption(_))));
    }

    #[test]
    fn test_no_wrap_is_access_denied() {
        let source = OsKeySource;
        let (a, outsider) = (member("a"), member("outsider"));
        let key = ResourceKey::generate(&source);
        let envelope = create_envelope(&key, &recipients(&[&a]), &source).unwrap();

        let result = open_envelope(&envelope, &outsider.id, &outsider.keys);
        assert!(matches!(result, Err(CryptoError::AccessDenied { user }) if user == outsider.id));
    }

    #[test]
    fn test_single_bit_flips_are_detected() {
        let source = OsKeySource;
        let a = member("a");
        let key = ResourceKey::generate(&source);
        let wrap = wrap_for(&key, &a.keys.public_key(), &source).unwrap();

        for byte in 0..wrap.ciphertext.len() {
            for bit in 0..8 {
                let mut tampered = wrap.clone();
                tampered.ciphertext[byte] ^= 1 << bit;
                assert!(matches!(open_wrap(&tampered, &a.keys), Err(CryptoError::Corruption(_))));
            }
        }

        for byte in 0..crate::symmetric::NONCE_SIZE {
            for bit in 0..8 {
                let mut nonce = *wrap.nonce.as_bytes();
                nonce[byte] ^= 1 << bit;
                let tampered = Wrap {
                    nonce: Nonce::from_bytes(nonce),
                    ..wrap.clone()
                };
                assert!(matches!(open_wrap(&tampered, &a.keys), Err(CryptoError::Corruption(_))));
            }
        }
    }

    #[test]
    fn test_malformed_encapsulated_key() {
        let source = OsKeySource;
        let a = member("a");
        let key = ResourceKey::generate(&source);
        let wrap = wrap_for(&key, &a.keys.public_key(), &source).unwrap();

        let mut json = serde_json::to_value(&wrap).unwrap();
        json["encapsulatedKey"] = serde_json::Value::String(crate::encoding::encode([0u8; 32]));
        let truncated: Wrap = serde_json::from_value(json).unwrap();

        assert!(matches!(
            open_wrap(&truncated, &a.keys),
            Err(CryptoError::InvalidPQCiphertext(_))
        ));
    }

    #[test]
    fn test_wrap_record_shape_and_encodings() {
        let source = OsKeySource;
        let a = member("a");
        let key = ResourceKey::generate(&source);
        let envelope = create_envelope(&key, &recipients(&[&a]), &source).unwrap();

        let json = serde_json::to_value(&envelope).unwrap();
        let wrap_json = json["a"].as_object().unwrap();
        assert_eq!(wrap_json.len(), 3);
        for field in ["encapsulatedKey", "nonce", "ciphertext"] {
            assert!(wrap_json[field].is_string(), "{field}");
        }
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);

        let wrap = envelope.get(&a.id).unwrap();
        let bytes = wrap.to_bytes().unwrap();
        assert_eq!(&Wrap::from_bytes(&bytes).unwrap(), wrap);
        assert!(Wrap::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_file_share_scenario() {
        let source = OsKeySource;
        let (a, b) = (member("a"), member("b"));

        let key = ResourceKey::generate(&source);
        let envelope = create_envelope(&key, &recipients(&[&a, &b]), &source).unwrap();
        let stored = key.encrypt_content(b"hello", &source).unwrap();

        let ka = open_envelope(&envelope, &a.id, &a.keys).unwrap();
        let kb = open_envelope(&envelope, &b.id, &b.keys).unwrap();
        assert_eq!(ka.decrypt_content(&stored).unwrap(), b"hello");
        assert_eq!(kb.decrypt_content(&stored).unwrap(), b"hello");
    }
}
