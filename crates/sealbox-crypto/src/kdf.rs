//! Memory-hard key derivation
//!
//! Turns low-entropy secrets (passphrases, hardware credential IDs) into
//! [`SymmetricKey`]s with Argon2id. Salts are always fresh per derivation
//! and stored next to the ciphertext they protect.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use crate::error::{CryptoError, CryptoResult};
use crate::random::{KeySource, random_array};
use crate::secure_bytes::SecureBytes;
use crate::symmetric::{KEY_SIZE, SymmetricKey};

/// Salt length in bytes
pub const SALT_SIZE: usize = 16;

/// Argon2id cost parameters
///
/// Fixed per deployment and threaded through constructors. Changing them
/// makes existing salted ciphertexts undecryptable, so keep old values
/// around (see `legacy_kdf` in the access configuration) when tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    /// 64 MiB, 3 passes, 4 lanes.
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Parameters for long-lived secrets such as private keys (256 MiB, 4 passes)
    pub fn sensitive() -> Self {
        Self {
            memory_kib: 262_144,
            iterations: 4,
            parallelism: 4,
        }
    }

    /// Cheap parameters for tests (1 MiB, 1 pass). Never use in production.
    pub fn testing() -> Self {
        Self {
            memory_kib: 1_024,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Check the parameters are accepted by Argon2
    pub fn validate(&self) -> CryptoResult<()> {
        self.to_argon2().map(|_| ())
    }

    fn to_argon2(&self) -> CryptoResult<Params> {
        Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_SIZE))
            .map_err(|e| CryptoError::KeyDerivationFailed(format!("Invalid Argon2 params: {}", e)))
    }
}

/// Random per-derivation salt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Draw a fresh salt
    pub fn generate(source: &dyn KeySource) -> Self {
        Self(random_array(source))
    }

    /// Wrap stored salt bytes
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let salt: [u8; SALT_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::format(format!("salt must be {} bytes, got {}", SALT_SIZE, bytes.len()))
        })?;
        Ok(Self(salt))
    }

    /// Raw salt bytes
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

/// Normalize a passphrase before derivation.
///
/// Unicode NFC, so composed and decomposed forms of the same text derive
/// the same key. Case and whitespace are significant.
pub fn normalize_passphrase(raw: &str) -> SecureBytes {
    let nfc: String = raw.nfc().collect();
    SecureBytes::new(nfc.into_bytes())
}

/// Derive a 256-bit key from a low-entropy secret
pub fn derive_key(secret: &[u8], salt: &Salt, params: &KdfParams) -> CryptoResult<SymmetricKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut output = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(secret, salt.as_bytes(), &mut output)
        .map_err(|e| CryptoError::KeyDerivationFailed(format!("Argon2id failed: {}", e)))?;

    let key = SymmetricKey::from_bytes(output);
    zeroize::Zeroize::zeroize(&mut output);
    Ok(key)
}
