//! Identity lookup and unlocked principals
//!
//! The identity layer maps a user id to a public key. Whatever key it
//! returns is trusted; there is no separate key-transparency check.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;
use zeroize::Zeroizing;

use sealbox_core::UserId;
use sealbox_crypto::{KemKeyPair, KemPublicKey, KeyPairProvider, PublicKeyRecord, StoredKeyPair, UnlockFactor};

use crate::error::{AccessError, AccessResult};

/// Public key directory
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up a user's current public key
    async fn public_key(&self, user: &UserId) -> AccessResult<KemPublicKey>;
}

/// In-memory public key directory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    keys: DashMap<UserId, KemPublicKey>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish (or replace) a user's public key
    pub fn register(&self, record: PublicKeyRecord) {
        debug!(user = %record.user_id, fingerprint = %record.fingerprint(), "Registered public key");
        self.keys.insert(record.user_id, record.public_key);
    }

    /// Remove a user from the directory
    pub fn unregister(&self, user: &UserId) -> bool {
        self.keys.remove(user).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for InMemoryDirectory {
    async fn public_key(&self, user: &UserId) -> AccessResult<KemPublicKey> {
        self.keys
            .get(user)
            .map(|key| key.clone())
            .ok_or_else(|| AccessError::UnknownUser(user.clone()))
    }
}

/// An unlocked user: id plus private key material in memory
pub struct Principal {
    user_id: UserId,
    key_pair: KemKeyPair,
    legacy_passphrase: Option<Zeroizing<String>>,
}

impl Principal {
    pub fn new(user_id: impl Into<UserId>, key_pair: KemKeyPair) -> Self {
        Self {
            user_id: user_id.into(),
            key_pair,
            legacy_passphrase: None,
        }
    }

    /// Unlock a stored key pair with `factor`
    pub fn unlock(
        user_id: impl Into<UserId>,
        provider: &KeyPairProvider,
        stored: &StoredKeyPair,
        factor: &UnlockFactor,
    ) -> AccessResult<Self> {
        let key_pair = provider.unlock(stored, factor)?;
        Ok(Self::new(user_id, key_pair))
    }

    /// Attach the shared passphrase that opens data in the legacy format
    pub fn with_legacy_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.legacy_passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn key_pair(&self) -> &KemKeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> KemPublicKey {
        self.key_pair.public_key()
    }

    pub(crate) fn legacy_passphrase(&self) -> Option<&str> {
        self.legacy_passphrase.as_deref().map(String::as_str)
    }

    /// Public record for the directory
    pub fn public_record(&self) -> PublicKeyRecord {
        PublicKeyRecord::new(self.user_id.clone(), self.public_key())
    }
}

impl std::fmt::Debug for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Principal")
            .field("user_id", &self.user_id)
            .field("key", &self.key_pair.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealbox_crypto::{KdfParams, os_key_source};

    #[tokio::test]
    async fn test_directory_lookup() {
        let directory = InMemoryDirectory::new();
        let alice = Principal::new("alice", KemKeyPair::generate());
        directory.register(alice.public_record());

        let key = directory.public_key(alice.user_id()).await.unwrap();
        assert_eq!(key, alice.public_key());

        let missing = directory.public_key(&UserId::new("nobody")).await;
        assert!(matches!(missing, Err(AccessError::UnknownUser(_))));

        assert!(directory.unregister(alice.user_id()));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_unlock_principal() {
        let provider = KeyPairProvider::new(KdfParams::testing(), os_key_source());
        let keys = provider.generate_key_pair();
        let factor = UnlockFactor::passphrase("open sesame");
        let stored = provider.store_key_pair(&keys, &factor).unwrap();

        let principal = Principal::unlock("alice", &provider, &stored, &factor).unwrap();
        assert_eq!(principal.public_key(), keys.public_key());

        let wrong = UnlockFactor::passphrase("close sesame");
        let result = Principal::unlock("alice", &provider, &stored, &wrong);
        assert!(matches!(
            result,
            Err(AccessError::Crypto(sealbox_crypto::CryptoError::Authentication))
        ));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let principal = Principal::new("alice", KemKeyPair::generate()).with_legacy_passphrase("hunter2");
        let debug = format!("{:?}", principal);
        assert!(!debug.contains("hunter2"));
        assert_eq!(principal.legacy_passphrase(), Some("hunter2"));
    }
}
