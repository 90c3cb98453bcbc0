//! Sources of key material
//!
//! Resource keys, nonces and salts are drawn from a [`KeySource`] passed in
//! by the caller rather than from an ambient generator, so tests can pin
//! the bytes. KEM keypairs and encapsulations use the PQ backend's own
//! system randomness and are not affected.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Supplier of cryptographically secure random bytes
pub trait KeySource: Send + Sync {
    /// Fill `dest` with random bytes
    fn fill_bytes(&self, dest: &mut [u8]);

    /// Draw a fixed-size array
    fn array<const N: usize>(&self) -> [u8; N]
    where
        Self: Sized,
    {
        let mut out = [0u8; N];
        self.fill_bytes(&mut out);
        out
    }
}

/// Operating-system backed randomness (thread-local CSPRNG seeded from the OS)
#[derive(Debug, Clone, Copy, Default)]
pub struct OsKeySource;

impl KeySource for OsKeySource {
    fn fill_bytes(&self, dest: &mut [u8]) {
        rand::rng().fill_bytes(dest);
    }
}

/// Deterministic source for tests and reproducible fixtures
///
/// Never use outside tests: every instance with the same seed yields the
/// same key stream.
#[derive(Debug)]
pub struct SeededKeySource {
    rng: Mutex<StdRng>,
}

impl SeededKeySource {
    /// Create a source from a 64-bit seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl KeySource for SeededKeySource {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}

/// Shared handle to a key source
pub type SharedKeySource = Arc<dyn KeySource>;

/// Default shared key source backed by the OS
pub fn os_key_source() -> SharedKeySource {
    Arc::new(OsKeySource)
}

/// Fill a fixed-size array from a (possibly unsized) source
pub(crate) fn random_array<const N: usize>(source: &dyn KeySource) -> [u8; N] {
    let mut out = [0u8; N];
    source.fill_bytes(&mut out);
    out
}
