//! Per-user KEM key pairs and their sealed storage form
//!
//! Each user owns one [`KemKeyPair`]. The public half is published through
//! a [`PublicKeyRecord`]. The private half is only ever stored sealed:
//!
//! - under a passphrase or hardware credential: Argon2id-derived key, salted
//!   `{ciphertext, salt, nonce}` shape
//! - under a device key: already high-entropy, unsalted `{ciphertext, nonce}`
//!
//! Both shapes are a [`SealedValue`], so they read back through the same
//! classification as every other stored ciphertext.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use sealbox_core::UserId;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{KdfParams, normalize_passphrase};
use crate::metadata::{EncryptedMetadata, LegacyCiphertext};
use crate::migration::SealedValue;
use crate::pq_kem::{KemKeyPair, KemPublicKey};
use crate::random::SharedKeySource;
use crate::secure_bytes::SecureBytes;
use crate::symmetric::SymmetricKey;

/// Stored form of a private key
pub type SealedPrivateKey = SealedValue;

/// A factor that unlocks a sealed private key
///
/// Every variant wipes its secret on drop.
pub enum UnlockFactor {
    /// A user-chosen passphrase (NFC-normalized before derivation)
    Passphrase(Zeroizing<String>),
    /// A hardware or biometric credential identifier
    Credential(SecureBytes),
    /// A 256-bit key held by a trusted device
    DeviceKey(SymmetricKey),
}

impl UnlockFactor {
    pub fn passphrase(passphrase: impl Into<String>) -> Self {
        Self::Passphrase(Zeroizing::new(passphrase.into()))
    }

    pub fn credential(credential: impl Into<Vec<u8>>) -> Self {
        Self::Credential(SecureBytes::new(credential.into()))
    }
}

impl std::fmt::Debug for UnlockFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Passphrase(_) => "Passphrase",
            Self::Credential(_) => "Credential",
            Self::DeviceKey(_) => "DeviceKey",
        };
        write!(f, "UnlockFactor::{}(..)", kind)
    }
}

/// A user's published public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyRecord {
    pub user_id: UserId,
    pub public_key: KemPublicKey,
}

impl PublicKeyRecord {
    pub fn new(user_id: UserId, public_key: KemPublicKey) -> Self {
        Self { user_id, public_key }
    }

    /// Fingerprint of the published key
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint()
    }
}

/// Storage form of a whole key pair: `{publicKey, privateKey}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyPair {
    pub public_key: KemPublicKey,
    pub private_key: SealedPrivateKey,
}

/// Generates, seals and unseals user key pairs
#[derive(Clone)]
pub struct KeyPairProvider {
    params: KdfParams,
    source: SharedKeySource,
}

impl KeyPairProvider {
    /// Create a provider. `params` applies to passphrase and credential sealing.
    pub fn new(params: KdfParams, source: SharedKeySource) -> Self {
        Self { params, source }
    }

    /// Generate a fresh key pair for a new account
    pub fn generate_key_pair(&self) -> KemKeyPair {
        let keypair = KemKeyPair::generate();
        debug!(fingerprint = %keypair.public_key().fingerprint(), "Generated key pair");
        keypair
    }

    /// Seal the private half under `factor`
    #[instrument(skip_all, fields(factor = ?factor))]
    pub fn seal_private_key(&self, keypair: &KemKeyPair, factor: &UnlockFactor) -> CryptoResult<SealedPrivateKey> {
        let private = keypair.private_key_bytes();
        let source = self.source.as_ref();

        let sealed = match factor {
            UnlockFactor::Passphrase(passphrase) => {
                let secret = normalize_passphrase(passphrase);
                LegacyCiphertext::seal(private.as_slice(), secret.as_slice(), &self.params, source)?.into()
            }
            UnlockFactor::Credential(credential) => {
                LegacyCiphertext::seal(private.as_slice(), credential.as_slice(), &self.params, source)?.into()
            }
            UnlockFactor::DeviceKey(key) => EncryptedMetadata::seal(private.as_slice(), key, source)?.into(),
        };
        Ok(sealed)
    }

    /// Seal a key pair into its full storage form
    pub fn store_key_pair(&self, keypair: &KemKeyPair, factor: &UnlockFactor) -> CryptoResult<StoredKeyPair> {
        Ok(StoredKeyPair {
            public_key: keypair.public_key(),
            private_key: self.seal_private_key(keypair, factor)?,
        })
    }

    /// Unseal a private key and rebuild the key pair.
    ///
    /// Any failure to open the sealed value, including a factor of the
    /// wrong kind for its shape, is [`CryptoError::Authentication`] with
    /// no further detail.
    #[instrument(skip_all, fields(factor = ?factor))]
    pub fn unseal_private_key(
        &self,
        sealed: &SealedPrivateKey,
        public_key: &KemPublicKey,
        factor: &UnlockFactor,
    ) -> CryptoResult<KemKeyPair> {
        let private = SecureBytes::new(self.open(sealed, factor)?);
        let keypair = KemKeyPair::from_keypair_bytes(private.as_slice(), &public_key.to_bytes())?;

        // The sealed blob and the published key must belong together
        let (challenge, expected) = keypair.public_key().encapsulate();
        let recovered = keypair.decapsulate(&challenge)?;
        if recovered.as_bytes() != expected.as_bytes() {
            return Err(CryptoError::InvalidKey(
                "private key does not match public key".to_string(),
            ));
        }

        debug!(fingerprint = %public_key.fingerprint(), "Unsealed private key");
        Ok(keypair)
    }

    /// Unlock a stored key pair
    pub fn unlock(&self, stored: &StoredKeyPair, factor: &UnlockFactor) -> CryptoResult<KemKeyPair> {
        self.unseal_private_key(&stored.private_key, &stored.public_key, factor)
    }

    /// Re-seal under a new factor after a passphrase reset or a new
    /// hardware key. The key pair itself is unchanged.
    pub fn reseal_private_key(
        &self,
        sealed: &SealedPrivateKey,
        public_key: &KemPublicKey,
        current: &UnlockFactor,
        replacement: &UnlockFactor,
    ) -> CryptoResult<SealedPrivateKey> {
        let keypair = self.unseal_private_key(sealed, public_key, current)?;
        let resealed = self.seal_private_key(&keypair, replacement)?;
        debug!(fingerprint = %public_key.fingerprint(), "Re-sealed private key under new factor");
        Ok(resealed)
    }

    fn open(&self, sealed: &SealedPrivateKey, factor: &UnlockFactor) -> CryptoResult<Vec<u8>> {
        match (sealed, factor) {
            (SealedValue::Legacy(legacy), UnlockFactor::Passphrase(passphrase)) => {
                let secret = normalize_passphrase(passphrase);
                legacy.open(secret.as_slice(), &self.params)
            }
            (SealedValue::Legacy(legacy), UnlockFactor::Credential(credential)) => {
                legacy.open(credential.as_slice(), &self.params)
            }
            (SealedValue::Envelope(metadata), UnlockFactor::DeviceKey(key)) => {
                metadata.open(key).map_err(|_| CryptoError::Authentication)
            }
            _ => Err(CryptoError::Authentication),
        }
    }
}

impl std::fmt::Debug for KeyPairProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairProvider")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}
