//! Credential storage: iterated-MAC verifiers and sealed sequences.
//!
//! A generation keeps a [`Verifier`] for exact checks and a [`SealedSequence`]
//! so that fuzzy, codon, and protein comparisons can run against the
//! plaintext without it ever sitting in memory unencrypted between calls.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, canonical::CanonicalWriter, Digest};
use crate::entropy::EntropySource;

/// Salt and nonce length in bytes.
pub const SALT_LEN: usize = 16;

/// Verifier derivation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// MAC iterations.
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self { iterations: 2048 }
    }
}

/// Salted, iterated MAC of a sequence.
#[derive(Clone, PartialEq, Eq)]
pub struct Verifier {
    salt: [u8; SALT_LEN],
    iterations: u32,
    tag: Digest,
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier")
            .field("iterations", &self.iterations)
            .field("tag", &self.tag.short())
            .finish_non_exhaustive()
    }
}

fn random_salt(entropy: &dyn EntropySource) -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    entropy.fill(&mut salt);
    salt
}

fn derive(seq: &str, salt: &[u8; SALT_LEN], iterations: u32) -> Digest {
    let mut w = CanonicalWriter::new("phantom.dnauth.verifier");
    w.put_bytes(salt).put_u32(1);
    let mut block = crypto::mac(seq.as_bytes(), &w.finish());
    let mut acc = *block.as_bytes();
    for _ in 1..iterations.max(1) {
        block = crypto::mac(seq.as_bytes(), block.as_bytes());
        for (a, b) in acc.iter_mut().zip(block.as_bytes()) {
            *a ^= b;
        }
    }
    Digest::from_bytes(acc)
}

impl Verifier {
    /// Derive a verifier for `seq` under a fresh salt.
    pub fn new(seq: &str, params: KdfParams, entropy: &dyn EntropySource) -> Self {
        let salt = random_salt(entropy);
        Self {
            tag: derive(seq, &salt, params.iterations),
            salt,
            iterations: params.iterations,
        }
    }

    /// Constant-time check of `seq`.
    pub fn matches(&self, seq: &str) -> bool {
        crypto::ct_eq(&self.tag, &derive(seq, &self.salt, self.iterations))
    }

    /// Iterations used.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Public fingerprint of the verifier, safe to log and audit.
    pub fn fingerprint(&self) -> Digest {
        crypto::hash(self.tag.as_bytes())
    }
}

/// A sequence encrypted under the store's sealing key.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSequence {
    nonce: [u8; SALT_LEN],
    bytes: Vec<u8>,
}

impl fmt::Debug for SealedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealedSequence({} bytes)", self.bytes.len())
    }
}

impl SealedSequence {
    /// Seal `seq` for `user` under `secret`.
    pub fn seal(secret: &[u8], user: &str, seq: &str, entropy: &dyn EntropySource) -> Self {
        let nonce = random_salt(entropy);
        let key = crypto::derive_key(secret, "seal", user.as_bytes());
        Self {
            bytes: crypto::keystream_xor(key.as_bytes(), &nonce, seq.as_bytes()),
            nonce,
        }
    }

    /// Recover the plaintext.
    pub fn open(&self, secret: &[u8], user: &str) -> SecretSequence {
        let key = crypto::derive_key(secret, "seal", user.as_bytes());
        let plain = crypto::keystream_xor(key.as_bytes(), &self.nonce, &self.bytes);
        SecretSequence(String::from_utf8_lossy(&plain).into_owned())
    }
}

/// A plaintext sequence whose `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretSequence(String);

impl SecretSequence {
    /// Wrap a plaintext sequence.
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    /// The plaintext.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length in bases.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretSequence([REDACTED; {}])", self.0.len())
    }
}
