//! Post-quantum key encapsulation using Kyber768 (ML-KEM-768 equivalent)
//!
//! Every principal owns one [`KemKeyPair`]. Wrapping a resource key for a
//! recipient starts by encapsulating against their [`KemPublicKey`].
//!
//! ## Key Sizes (Kyber768 / ML-KEM-768 equivalent)
//!
//! - Encapsulation key (public): 1,184 bytes
//! - Decapsulation key (private): 2,400 bytes
//! - Ciphertext: 1,088 bytes
//! - Shared secret: 32 bytes
//!
//! Kyber uses implicit rejection: decapsulating with the wrong private key
//! does not fail, it yields an unrelated secret. Wrong-recipient detection
//! therefore happens at the AEAD layer above.

use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SecretKey as _, SharedSecret as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::encoding;
use crate::error::CryptoError;
use crate::secure_bytes::SecureBytes;
use crate::symmetric::SymmetricKey;

/// Size of the Kyber768 encapsulation key (public) in bytes
pub const PQ_ENCAPSULATION_KEY_SIZE: usize = kyber768::public_key_bytes();

/// Size of the Kyber768 decapsulation key (private) in bytes
pub const PQ_DECAPSULATION_KEY_SIZE: usize = kyber768::secret_key_bytes();

/// Size of the Kyber768 ciphertext in bytes
pub const PQ_CIPHERTEXT_SIZE: usize = kyber768::ciphertext_bytes();

/// Size of the shared secret in bytes
pub const PQ_SHARED_SECRET_SIZE: usize = kyber768::shared_secret_bytes();

/// A user's KEM key pair
///
/// Holds the private half in memory only while the principal is unlocked;
/// at rest it is sealed (see [`crate::keypair`]).
#[derive(Clone)]
pub struct KemKeyPair {
    public: kyber768::PublicKey,
    secret: kyber768::SecretKey,
}

impl KemKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let (public, secret) = kyber768::keypair();
        Self { public, secret }
    }

    /// Rebuild from stored private and public key bytes
    pub fn from_keypair_bytes(private_bytes: &[u8], public_bytes: &[u8]) -> Result<Self, CryptoError> {
        if private_bytes.len() != PQ_DECAPSULATION_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "Invalid decapsulation key size: expected {}, got {}",
                PQ_DECAPSULATION_KEY_SIZE,
                private_bytes.len()
            )));
        }

        let secret = kyber768::SecretKey::from_bytes(private_bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid Kyber decapsulation key: {:?}", e)))?;
        let public = KemPublicKey::from_bytes(public_bytes)?.key;

        Ok(Self { public, secret })
    }

    /// Export the private key bytes (zeroized when dropped)
    pub fn private_key_bytes(&self) -> SecureBytes {
        SecureBytes::new(self.secret.as_bytes().to_vec())
    }

    /// The public half
    pub fn public_key(&self) -> KemPublicKey {
        KemPublicKey {
            key: self.public.clone(),
        }
    }

    /// Decapsulate to recover the shared secret chosen by the encapsulator
    pub fn decapsulate(&self, encapsulated: &EncapsulatedKey) -> Result<SharedSecret, CryptoError> {
        let ct = kyber768::Ciphertext::from_bytes(&encapsulated.bytes)
            .map_err(|e| CryptoError::PQDecapsulationFailed(format!("Invalid ciphertext: {:?}", e)))?;

        let shared = kyber768::decapsulate(&ct, &self.secret);
        SharedSecret::from_slice(shared.as_bytes())
    }
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Public encapsulation key
///
/// Freely distributable. The identity layer maps each user ID to one of
/// these.
#[derive(Clone)]
pub struct KemPublicKey {
    key: kyber768::PublicKey,
}

impl KemPublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PQ_ENCAPSULATION_KEY_SIZE {
            return Err(CryptoError::InvalidKey(format!(
                "Invalid encapsulation key size: expected {}, got {}",
                PQ_ENCAPSULATION_KEY_SIZE,
                bytes.len()
            )));
        }

        let key = kyber768::PublicKey::from_bytes(bytes)
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid Kyber encapsulation key: {:?}", e)))?;
        Ok(Self { key })
    }

    /// Export to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.as_bytes().to_vec()
    }

    /// Encapsulate a fresh shared secret to the owner of this key
    pub fn encapsulate(&self) -> (EncapsulatedKey, SharedSecret) {
        let (shared, ciphertext) = kyber768::encapsulate(&self.key);

        let encapsulated = EncapsulatedKey {
            bytes: ciphertext.as_bytes().to_vec(),
        };
        let mut secret = [0u8; PQ_SHARED_SECRET_SIZE];
        secret.copy_from_slice(shared.as_bytes());

        (encapsulated, SharedSecret(secret))
    }

    /// Short BLAKE3 fingerprint for logs and key pinning
    pub fn fingerprint(&self) -> String {
        hex::encode(&blake3::hash(self.key.as_bytes()).as_bytes()[..8])
    }
}

impl std::fmt::Debug for KemPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemPublicKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl PartialEq for KemPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.as_bytes() == other.key.as_bytes()
    }
}

impl Eq for KemPublicKey {}

impl Serialize for KemPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encoding::base64_bytes::serialize(&self.key.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for KemPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = encoding::base64_bytes::deserialize(deserializer)?;
        KemPublicKey::from_bytes(&bytes).map_err(D::Error::custom)
    }
}

/// KEM ciphertext carried in a wrap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncapsulatedKey {
    #[serde(with = "crate::encoding::base64_bytes")]
    bytes: Vec<u8>,
}

impl EncapsulatedKey {
    /// Create from raw bytes, checking the length
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != PQ_CIPHERTEXT_SIZE {
            return Err(CryptoError::InvalidPQCiphertext(format!(
                "Invalid ciphertext size: expected {}, got {}",
                PQ_CIPHERTEXT_SIZE,
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length check for values that arrived through deserialization
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.bytes.len() != PQ_CIPHERTEXT_SIZE {
            return Err(CryptoError::InvalidPQCiphertext(format!(
                "Invalid ciphertext size: expected {}, got {}",
                PQ_CIPHERTEXT_SIZE,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

/// Per-encapsulation shared secret, zeroized on drop
///
/// Only ever used as the AEAD key for one wrap. Content is never
/// encrypted under it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; PQ_SHARED_SECRET_SIZE]);

impl SharedSecret {
    fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; PQ_SHARED_SECRET_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::PQDecapsulationFailed("unexpected shared secret length".to_string()))?;
        Ok(Self(secret))
    }

    /// Use the secret as a wrap key
    pub fn as_wrap_key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.0)
    }

    /// Raw secret bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8; PQ_SHARED_SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encapsulate_decapsulate() {
        let alice = KemKeyPair::generate();

        let (encapsulated, sender_secret) = alice.public_key().encapsulate();
        let alice_secret = alice.decapsulate(&encapsulated).unwrap();

        assert_eq!(alice_secret.as_bytes(), sender_secret.as_bytes());
    }

    #[test]
    fn test_wrong_keypair_gets_different_secret() {
        let alice = KemKeyPair::generate();
        let eve = KemKeyPair::generate();

        let (encapsulated, sender_secret) = alice.public_key().encapsulate();

        // Implicit rejection: no error, just an unrelated secret
        let eve_secret = eve.decapsulate(&encapsulated).unwrap();
        assert_ne!(eve_secret.as_bytes(), sender_secret.as_bytes());
    }

    #[test]
    fn test_keypair_bytes_roundtrip() {
        let keypair = KemKeyPair::generate();
        let private = keypair.private_key_bytes();
        let public = keypair.public_key().to_bytes();
        let restored = KemKeyPair::from_keypair_bytes(private.as_slice(), &public).unwrap();

        assert_eq!(keypair.public_key(), restored.public_key());

        let (encapsulated, secret) = keypair.public_key().encapsulate();
        let restored_secret = restored.decapsulate(&encapsulated).unwrap();
        assert_eq!(secret.as_bytes(), restored_secret.as_bytes());
    }

    #[test]
    fn test_invalid_key_sizes() {
        let result = KemKeyPair::from_keypair_bytes(&[0u8; 100], &[0u8; PQ_ENCAPSULATION_KEY_SIZE]);
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));

        assert!(KemPublicKey::from_bytes(&[0u8; 100]).is_err());
        assert!(matches!(
            EncapsulatedKey::from_bytes(vec![0u8; 10]),
            Err(CryptoError::InvalidPQCiphertext(_))
        ));
    }

    #[test]
    fn test_key_sizes() {
        let keypair = KemKeyPair::generate();
        assert_eq!(keypair.private_key_bytes().len(), PQ_DECAPSULATION_KEY_SIZE);
        assert_eq!(keypair.public_key().to_bytes().len(), PQ_ENCAPSULATION_KEY_SIZE);

        let (encapsulated, _) = keypair.public_key().encapsulate();
        assert_eq!(encapsulated.as_bytes().len(), PQ_CIPHERTEXT_SIZE);
        assert!(encapsulated.validate().is_ok());
    }

    #[test]
    fn test_public_key_serde_and_fingerprint() {
        let keypair = KemKeyPair::generate();
        let public = keypair.public_key();

        let json = serde_json::to_string(&public).unwrap();
        let back: KemPublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, public);
        assert_eq!(back.fingerprint(), public.fingerprint());
        assert_eq!(public.fingerprint().len(), 16);

        let other = KemKeyPair::generate().public_key();
        assert_ne!(other, public);
    }
}
