//! Hash and MAC primitives shared by every component.
//!
//! SHA-256 for content addressing and chaining, HMAC-SHA256 for signatures
//! and key derivation. Records are always hashed over their
//! [`canonical`] encoding so the same logical record yields the same digest
//! in every process.

pub mod canonical;

use std::fmt;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

/// Width of every digest and tag.
pub const DIGEST_LEN: usize = 32;

/// 32-byte SHA-256 digest or HMAC-SHA256 tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// All-zero digest, used as the chain predecessor of the first event.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LEN]);

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let raw = hex::decode(s)
            .map_err(|e| CoreError::InvalidInput(format!("bad digest hex: {e}")))?;
        let bytes: [u8; DIGEST_LEN] = raw
            .try_into()
            .map_err(|_| CoreError::InvalidInput("digest must be 32 bytes".to_owned()))?;
        Ok(Self(bytes))
    }

    /// First eight hex characters, for logs.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(8);
        s
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// SHA-256 of `bytes`.
pub fn hash(bytes: &[u8]) -> Digest {
    Digest(Sha256::digest(bytes).into())
}

// HMAC accepts keys of any length, so construction never fails in practice.
fn keyed(key: &[u8]) -> Option<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key).ok()
}

/// HMAC-SHA256 of `bytes` under `key`.
pub fn mac(key: &[u8], bytes: &[u8]) -> Digest {
    match keyed(key) {
        Some(mut m) => {
            m.update(bytes);
            Digest(m.finalize().into_bytes().into())
        }
        None => Digest::ZERO,
    }
}

/// Constant-time check of `tag` against HMAC-SHA256 of `bytes` under `key`.
pub fn verify_mac(key: &[u8], bytes: &[u8], tag: &Digest) -> bool {
    match keyed(key) {
        Some(mut m) => {
            m.update(bytes);
            m.verify_slice(tag.as_bytes()).is_ok()
        }
        None => false,
    }
}

/// Constant-time digest equality.
pub fn ct_eq(a: &Digest, b: &Digest) -> bool {
    a.0.iter().zip(b.0.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Derive a 32-byte subkey of `secret` bound to `label` and `context`.
pub fn derive_key(secret: &[u8], label: &str, context: &[u8]) -> Digest {
    let mut w = canonical::CanonicalWriter::new("phantom.kdf");
    w.put_str(label);
    w.put_bytes(context);
    mac(secret, &w.finish())
}

/// XOR `data` with an HMAC-SHA256 counter keystream under `key` and `nonce`.
///
/// Applying it twice with the same key and nonce restores the input.
pub fn keystream_xor(key: &[u8], nonce: &[u8], data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (counter, chunk) in (0u64..).zip(data.chunks(DIGEST_LEN)) {
        let mut block_input = Vec::with_capacity(nonce.len().saturating_add(8));
        block_input.extend_from_slice(nonce);
        block_input.extend_from_slice(&counter.to_be_bytes());
        let block = mac(key, &block_input);
        out.extend(chunk.iter().zip(block.0.iter()).map(|(d, k)| d ^ k));
    }
    out
}
