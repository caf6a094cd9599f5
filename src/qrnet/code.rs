//! QRNet code records, their signed encoding, and the compact payload.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::crypto::canonical::CanonicalWriter;
use crate::crypto::Digest;
use crate::error::{CoreError, ErrorKind};

/// Salt length drawn per code.
pub const SALT_LEN: usize = 16;

/// Payload prefix.
pub const PAYLOAD_PREFIX: &str = "QR:";

/// Approximate alphanumeric capacity of QR versions 1 to 40.
const QR_CAPACITY: [usize; 40] = [
    17, 32, 53, 78, 106, 134, 154, 192, 230, 271, 321, 367, 425, 458, 520, 586, 644, 718, 792,
    858, 929, 1003, 1091, 1171, 1273, 1367, 1465, 1528, 1628, 1732, 1840, 1952, 2068, 2188,
    2303, 2431, 2563, 2699, 2809, 2953,
];

/// Largest QR version.
pub const QR_VERSION_MAX: u8 = 40;

/// How much protection the destination deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileClass {
    /// User data.
    User,
    /// System files.
    System,
    /// Constitutional files.
    Constitutional,
    /// Critical infrastructure.
    Critical,
}

impl FileClass {
    /// Smallest QR version codes of this class are rendered at.
    pub fn min_version(self) -> u8 {
        match self {
            Self::User => 8,
            Self::System => 15,
            Self::Constitutional => 25,
            Self::Critical => 40,
        }
    }

    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::System => "SYSTEM",
            Self::Constitutional => "CONSTITUTIONAL",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Transitions never delete a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CodeState {
    /// Valid.
    Active,
    /// Replaced by a newer code.
    Superseded,
    /// Revoked.
    Revoked,
    /// Past its expiry tick.
    Expired,
}

impl CodeState {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Superseded => "SUPERSEDED",
            Self::Revoked => "REVOKED",
            Self::Expired => "EXPIRED",
        }
    }
}

/// Coarse result of a verification.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    /// Signature failed or the code is unusable.
    Untrusted,
    /// Signature holds but the creator's key is not valid.
    Low,
    /// Signature and creator hold, governor state is stale.
    Medium,
    /// Every check passed.
    High,
}

impl TrustLevel {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "UNTRUSTED",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signed link from a destination to content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCode {
    /// Identifier, starting at 1.
    pub code_id: u32,
    /// Opaque destination.
    pub destination_path: String,
    /// Hash of the linked content.
    pub content_hash: Digest,
    /// Protection class.
    pub file_class: FileClass,
    /// Signing user.
    pub creator: String,
    /// Governor state version at creation.
    pub governor_state_version: u64,
    /// Random salt covered by the signature.
    pub salt: [u8; SALT_LEN],
    /// MAC over [`signed_bytes`](Self::signed_bytes) under the creator's identity key.
    pub signature: Digest,
    /// Lifecycle state.
    pub state: CodeState,
    /// Creation tick.
    pub created_at: Tick,
    /// Expiry tick.
    pub expires_at: Option<Tick>,
    /// Code this one superseded.
    pub predecessor: Option<u32>,
    /// Code that superseded this one.
    pub superseded_by: Option<u32>,
    /// Reason given on revoke.
    pub revoke_reason: Option<String>,
    /// Rendered QR version.
    pub qr_version: u8,
    /// Compact payload.
    pub qr_payload: String,
    /// Verifications performed.
    pub verification_count: u64,
    /// Tick of the last verification.
    pub last_verified: Option<Tick>,
}

impl QrCode {
    /// Canonical encoding of every signed field.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new("phantom.qrnet.code");
        w.put_u32(self.code_id)
            .put_str(&self.destination_path)
            .put_digest(&self.content_hash)
            .put_str(self.file_class.as_str())
            .put_str(&self.creator)
            .put_u64(self.governor_state_version)
            .put_bytes(&self.salt)
            .put_u64(self.created_at)
            .put_opt_u64(self.expires_at)
            .put_opt_u64(self.predecessor.map(u64::from));
        w.finish()
    }

    /// Render the compact payload.
    pub fn render_payload(&self) -> String {
        format!(
            "{PAYLOAD_PREFIX}{}|{}|{}|{}|{}|{}|{}",
            self.code_id,
            self.destination_path,
            self.content_hash.to_hex(),
            self.creator,
            self.governor_state_version,
            self.signature.to_hex(),
            self.created_at
        )
    }

    /// Whether the expiry tick has passed.
    pub fn is_past_expiry(&self, now: Tick) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Fields decoded from a compact payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFields {
    /// Code id.
    pub code_id: u32,
    /// Destination.
    pub destination_path: String,
    /// Content hash.
    pub content_hash: Digest,
    /// Creator.
    pub creator: String,
    /// Governor state version.
    pub governor_state_version: u64,
    /// Signature.
    pub signature: Digest,
    /// Creation tick.
    pub created_at: Tick,
}

fn field<'a>(parts: &mut impl Iterator<Item = &'a str>, name: &str) -> Result<&'a str, CoreError> {
    parts
        .next()
        .ok_or_else(|| CoreError::InvalidInput(format!("payload is missing {name}")))
}

fn number<T: std::str::FromStr>(s: &str, name: &str) -> Result<T, CoreError> {
    s.parse()
        .map_err(|_| CoreError::InvalidInput(format!("payload {name} is not a number")))
}

/// Decode a compact payload.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] for a missing prefix, a wrong field
/// count, or a malformed field.
pub fn parse_payload(payload: &str) -> Result<PayloadFields, CoreError> {
    let body = payload
        .strip_prefix(PAYLOAD_PREFIX)
        .ok_or_else(|| CoreError::InvalidInput("payload prefix missing".to_owned()))?;
    let mut parts = body.split('|');
    let fields = PayloadFields {
        code_id: number(field(&mut parts, "code id")?, "code id")?,
        destination_path: field(&mut parts, "path")?.to_owned(),
        content_hash: Digest::from_hex(field(&mut parts, "content hash")?)?,
        creator: field(&mut parts, "creator")?.to_owned(),
        governor_state_version: number(field(&mut parts, "governor version")?, "governor version")?,
        signature: Digest::from_hex(field(&mut parts, "signature")?)?,
        created_at: number(field(&mut parts, "created tick")?, "created tick")?,
    };
    if parts.next().is_some() {
        return Err(CoreError::InvalidInput("payload has extra fields".to_owned()));
    }
    Ok(fields)
}

/// Smallest QR version that holds `payload_len` characters, never below the
/// class minimum.
pub fn qr_version_for(class: FileClass, payload_len: usize) -> u8 {
    let needed = (1u8..=QR_VERSION_MAX)
        .zip(QR_CAPACITY)
        .find(|(_, cap)| *cap >= payload_len)
        .map_or(QR_VERSION_MAX, |(v, _)| v);
    needed.max(class.min_version())
}

/// Outcome of checking one code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    /// Code checked.
    pub code_id: u32,
    /// Whether the code verified.
    pub ok: bool,
    /// Kind of the first failed check.
    pub failure: Option<ErrorKind>,
    /// MAC over the signed fields holds.
    pub signature_valid: bool,
    /// Recorded governor version equals the current one.
    pub governor_state_valid: bool,
    /// Creator's DNAuth key exists and is usable.
    pub dnauth_valid: bool,
    /// Coarse trust.
    pub trust_level: TrustLevel,
    /// State after the check.
    pub state: CodeState,
    /// Human-readable notes.
    pub details: String,
    /// Audit sequence of the verification event.
    pub audit_seq: u64,
}

/// Trust from the three checks: all pass is HIGH, a stale governor version
/// drops to MEDIUM, an unusable creator to LOW, a bad signature to UNTRUSTED.
pub fn trust_level(signature_valid: bool, dnauth_valid: bool, governor_state_valid: bool) -> TrustLevel {
    match (signature_valid, dnauth_valid, governor_state_valid) {
        (false, _, _) => TrustLevel::Untrusted,
        (true, false, _) => TrustLevel::Low,
        (true, true, false) => TrustLevel::Medium,
        (true, true, true) => TrustLevel::High,
    }
}
