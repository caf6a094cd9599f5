//! Error kinds surfaced by every core operation.
//!
//! Library operations return [`CoreError`]. Callers that only care about the
//! failure class match on [`CoreError::kind`], which maps onto a small,
//! stable set of upper-case names.

use std::fmt;

use serde::Serialize;

use crate::clock::Tick;

/// Stable failure class of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed input.
    InvalidInput,
    /// No such user, code, or event.
    NotFound,
    /// Sequence did not match under the requested mode.
    BadCredential,
    /// Too many recent failures.
    Locked,
    /// Target record has been revoked.
    Revoked,
    /// MAC verification failed.
    BadSignature,
    /// Code was signed under an older governor state version.
    GovStateMismatch,
    /// Creator's DNAuth key is no longer valid.
    DnauthInvalid,
    /// Request carried the destructive capability.
    DestructiveDenied,
    /// Rejected by strict mode.
    StrictDenied,
    /// Interactive approval deadline elapsed.
    ApprovalTimeout,
    /// Audit append failed; the mutation was not applied.
    AuditFailure,
    /// A user with that id is already registered.
    UserExists,
    /// Record is past its expiry tick.
    Expired,
    /// The approval collaborator declined the request.
    Declined,
    /// Cancelled before commit.
    Cancelled,
}

impl ErrorKind {
    /// Upper-case wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "INVALID_INPUT",
            Self::NotFound => "NOT_FOUND",
            Self::BadCredential => "BAD_CREDENTIAL",
            Self::Locked => "LOCKED",
            Self::Revoked => "REVOKED",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::GovStateMismatch => "GOV_STATE_MISMATCH",
            Self::DnauthInvalid => "DNAUTH_INVALID",
            Self::DestructiveDenied => "DESTRUCTIVE_DENIED",
            Self::StrictDenied => "STRICT_DENIED",
            Self::ApprovalTimeout => "APPROVAL_TIMEOUT",
            Self::AuditFailure => "AUDIT_FAILURE",
            Self::UserExists => "USER_EXISTS",
            Self::Expired => "EXPIRED",
            Self::Declined => "DECLINED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the governor, DNAuth store, QRNet registry and audit log.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The named record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Record family ("user", "code", "content").
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Candidate sequence did not match.
    #[error("credential rejected for {user}")]
    BadCredential {
        /// User the attempt was made for.
        user: String,
    },

    /// The user is locked out.
    #[error("{user} is locked until tick {until}")]
    Locked {
        /// Locked user.
        user: String,
        /// Tick at which the lockout ends.
        until: Tick,
    },

    /// The record has been revoked.
    #[error("{entity} {id} is revoked")]
    Revoked {
        /// Record family.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    /// Signature over a code's canonical fields did not verify.
    #[error("signature check failed for code {code_id}")]
    BadSignature {
        /// Code that failed.
        code_id: u32,
    },

    /// Code's recorded governor version is stale.
    #[error("code {code_id} was signed under governor version {recorded}, current is {current}")]
    GovStateMismatch {
        /// Code that failed.
        code_id: u32,
        /// Version embedded in the code.
        recorded: u64,
        /// Version currently in force.
        current: u64,
    },

    /// The creator's DNAuth key is missing, revoked or expired.
    #[error("dnauth key of {creator} is not valid: {detail}")]
    DnauthInvalid {
        /// Creator user id.
        creator: String,
        /// Why the key is not valid.
        detail: String,
    },

    /// Request was auto-declined for carrying a destructive capability.
    #[error("destructive capability in request {name}")]
    DestructiveDenied {
        /// Requested name.
        name: String,
    },

    /// Request was declined by strict mode.
    #[error("strict mode denied request {name}")]
    StrictDenied {
        /// Requested name.
        name: String,
    },

    /// The approval collaborator did not answer in time.
    #[error("approval timed out for request {name}")]
    ApprovalTimeout {
        /// Requested name.
        name: String,
    },

    /// The approval collaborator declined.
    #[error("approval declined for request {name}")]
    Declined {
        /// Requested name.
        name: String,
    },

    /// Appending to the audit log failed.
    #[error("audit append failed: {0}")]
    AuditFailure(String),

    /// User id already registered.
    #[error("user already registered: {0}")]
    UserExists(String),

    /// The record has expired.
    #[error("{entity} {id} expired")]
    Expired {
        /// Record family.
        entity: &'static str,
        /// Record identifier.
        id: String,
    },

    /// A cancellation token fired before the operation committed.
    #[error("operation cancelled before commit")]
    Cancelled,
}

impl CoreError {
    /// Stable failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::BadCredential { .. } => ErrorKind::BadCredential,
            Self::Locked { .. } => ErrorKind::Locked,
            Self::Revoked { .. } => ErrorKind::Revoked,
            Self::BadSignature { .. } => ErrorKind::BadSignature,
            Self::GovStateMismatch { .. } => ErrorKind::GovStateMismatch,
            Self::DnauthInvalid { .. } => ErrorKind::DnauthInvalid,
            Self::DestructiveDenied { .. } => ErrorKind::DestructiveDenied,
            Self::StrictDenied { .. } => ErrorKind::StrictDenied,
            Self::ApprovalTimeout { .. } => ErrorKind::ApprovalTimeout,
            Self::Declined { .. } => ErrorKind::Declined,
            Self::AuditFailure(_) => ErrorKind::AuditFailure,
            Self::UserExists(_) => ErrorKind::UserExists,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether callers should stop issuing mutating requests.
    ///
    /// Only an audit failure is fatal; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuditFailure(_))
    }

    pub(crate) fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn revoked(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::Revoked {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn expired(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::Expired {
            entity,
            id: id.to_string(),
        }
    }
}
