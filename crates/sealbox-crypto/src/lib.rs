//! # Sealbox Crypto
//!
//! Post-quantum envelope encryption for Sealbox resources.
//!
//! A resource (file, folder, group, conversation) is encrypted once under a
//! random [`ResourceKey`]. That key is wrapped separately for every
//! recipient with Kyber768 key encapsulation, so access can be granted
//! without any party, storage included, seeing a shared plaintext key.
//!
//! ## Features
//!
//! - XChaCha20-Poly1305 authenticated encryption with random 24-byte nonces
//! - Argon2id key derivation for passphrases and hardware credentials
//! - Kyber768 (ML-KEM-768 equivalent) per-recipient key wrapping
//! - Passphrase-sealed private keys with re-sealing on factor change
//! - Transparent reading of the older salted, passphrase-only format
//!
//! ## Key Types
//!
//! - [`KemKeyPair`] / [`KemPublicKey`]: a user's encapsulation key pair
//! - [`KeyPairProvider`]: generates and seals/unseals key pairs
//! - [`ResourceKey`]: the symmetric key of one resource
//! - [`Envelope`] / [`Wrap`]: the per-recipient wrap map
//! - [`SealedValue`] / [`MigrationAdapter`]: stored ciphertexts of either shape
//!
//! ## Example
//!
//! ```rust,ignore
//! use sealbox_crypto::{create_envelope, open_envelope, os_key_source, KemKeyPair, Recipient, ResourceKey};
//!
//! let source = os_key_source();
//! let alice = KemKeyPair::generate();
//!
//! let key = ResourceKey::generate(source.as_ref());
//! let envelope = create_envelope(&key, &[Recipient::new("alice", alice.public_key())], source.as_ref())?;
//! let blob = key.encrypt_content(b"hello", source.as_ref())?;
//!
//! let opened = open_envelope(&envelope, &"alice".into(), &alice)?;
//! assert_eq!(opened.decrypt_content(&blob)?, b"hello");
//! ```

pub mod encoding;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod keypair;
pub mod metadata;
pub mod migration;
pub mod pq_kem;
pub mod random;
pub mod resource_key;
pub mod secure_bytes;
pub mod symmetric;

// Re-exports
pub use envelope::{Envelope, Recipient, Wrap, create_envelope, open_envelope, open_wrap, wrap_for};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{KdfParams, SALT_SIZE, Salt, derive_key, normalize_passphrase};
pub use keypair::{KeyPairProvider, PublicKeyRecord, SealedPrivateKey, StoredKeyPair, UnlockFactor};
pub use metadata::{EncryptedMetadata, LegacyCiphertext};
pub use migration::{
    DecryptionContext, ENCRYPTED_PLACEHOLDER, MigrationAdapter, SealedValue, display_or_placeholder,
};
pub use pq_kem::{
    EncapsulatedKey, KemKeyPair, KemPublicKey, PQ_CIPHERTEXT_SIZE, PQ_DECAPSULATION_KEY_SIZE,
    PQ_ENCAPSULATION_KEY_SIZE, PQ_SHARED_SECRET_SIZE, SharedSecret,
};
pub use random::{KeySource, OsKeySource, SeededKeySource, SharedKeySource, os_key_source};
pub use resource_key::ResourceKey;
pub use secure_bytes::SecureBytes;
pub use symmetric::{
    KEY_SIZE, NONCE_SIZE, Nonce, Sealed, SymmetricKey, TAG_SIZE, decrypt_symmetric, encrypt_symmetric,
};
