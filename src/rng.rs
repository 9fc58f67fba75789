//! Random number generation for handshakes and timers.
//!
//! Every endpoint owns a [`SeededRng`]: a ChaCha based DRBG keyed from OS
//! entropy mixed with a caller supplied personalization string. When a seed
//! is configured via [`Config::rng_seed`](crate::Config::rng_seed) the OS
//! entropy is replaced by the seed, making handshakes reproducible in tests.

use rand::distributions::{Distribution, Standard};
use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, Rng, RngCore, SeedableRng};
use sha2::{Digest, Sha256};

pub struct SeededRng {
    inner: StdRng,
    seeded: bool,
}

impl SeededRng {
    /// Create a new RNG with an optional seed and no personalization.
    pub fn new(seed: Option<u64>) -> Self {
        Self::with_personalization(seed, &[])
    }

    /// Create a new RNG whose state also depends on `personalization`.
    pub fn with_personalization(seed: Option<u64>, personalization: &[u8]) -> Self {
        let mut entropy = [0_u8; 32];
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed).fill_bytes(&mut entropy),
            None => OsRng.fill_bytes(&mut entropy),
        }

        let mut hasher = Sha256::new();
        hasher.update(entropy);
        hasher.update(personalization);
        let key: [u8; 32] = hasher.finalize().into();

        Self {
            inner: StdRng::from_seed(key),
            seeded: seed.is_some(),
        }
    }

    /// Generate a random value of type T.
    pub fn random<T>(&mut self) -> T
    where
        Standard: Distribution<T>,
    {
        self.inner.gen()
    }
}

impl RngCore for SeededRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for SeededRng {}

impl std::fmt::Debug for SeededRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeededRng")
            .field("seeded", &self.seeded)
            .finish()
    }
}
