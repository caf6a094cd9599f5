//! Injectable randomness.
//!
//! DNAuth evolution, salts, and code nonces draw from an [`EntropySource`].
//! Production uses the OS generator; tests use [`SeededEntropy`] so that
//! evolution walks are reproducible.

use std::sync::{Mutex, PoisonError};

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

/// Source of random bytes.
pub trait EntropySource: Send + Sync {
    /// Fill `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);

    /// `n` fresh random bytes.
    fn bytes(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf);
        buf
    }

    /// A random `u32`.
    fn next_u32(&self) -> u32 {
        let mut buf = [0u8; 4];
        self.fill(&mut buf);
        u32::from_be_bytes(buf)
    }

    /// Uniform-ish index in `0..bound`; `0` when `bound` is zero.
    fn below(&self, bound: usize) -> usize {
        let r = usize::try_from(self.next_u32()).unwrap_or(0);
        r.checked_rem(bound).unwrap_or(0)
    }
}

/// Operating-system entropy.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// Deterministic generator seeded from a `u64`.
#[derive(Debug)]
pub struct SeededEntropy {
    rng: Mutex<StdRng>,
}

impl SeededEntropy {
    /// Create a generator from `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl EntropySource for SeededEntropy {
    fn fill(&self, buf: &mut [u8]) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.fill_bytes(buf);
    }
}
