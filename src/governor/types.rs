//! Governor vocabulary: capabilities, threat levels, behaviour flags, and
//! decision records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::crypto::canonical::CanonicalWriter;
use crate::crypto::Digest;
use crate::error::{CoreError, ErrorKind};

/// Maximum length of `summary` and `alternatives`.
pub const SUMMARY_MAX: usize = 200;

// ---------------------------------------------------------------------------
// Capabilities and behaviours
// ---------------------------------------------------------------------------

/// A permission atom a request may exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    /// Read files.
    FsRead,
    /// Write files.
    FsWrite,
    /// Hide files.
    FsHide,
    /// Rename, move, or create directories.
    FsStructure,
    /// Spawn processes.
    ProcSpawn,
    /// Suspend processes.
    ProcSuspend,
    /// Resume processes.
    ProcResume,
    /// Open outbound connections.
    NetConnect,
    /// Accept inbound connections.
    NetListen,
    /// Upgrade to a secure channel.
    NetSecure,
    /// Allocate memory.
    MemAlloc,
    /// Map memory.
    MemMap,
    /// Make memory executable.
    MemExec,
    /// Read system information.
    SysInfo,
    /// Read or write system configuration.
    SysConfig,
    /// Destroy data or processes. Always auto-declined.
    Destructive,
}

impl Capability {
    /// Every capability in declaration order.
    pub const ALL: [Capability; 16] = [
        Self::FsRead,
        Self::FsWrite,
        Self::FsHide,
        Self::FsStructure,
        Self::ProcSpawn,
        Self::ProcSuspend,
        Self::ProcResume,
        Self::NetConnect,
        Self::NetListen,
        Self::NetSecure,
        Self::MemAlloc,
        Self::MemMap,
        Self::MemExec,
        Self::SysInfo,
        Self::SysConfig,
        Self::Destructive,
    ];

    /// Position in [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit in a [`CapSet`].
    pub fn bit(self) -> u16 {
        1u16.wrapping_shl(self as u32)
    }

    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FsRead => "FS_READ",
            Self::FsWrite => "FS_WRITE",
            Self::FsHide => "FS_HIDE",
            Self::FsStructure => "FS_STRUCTURE",
            Self::ProcSpawn => "PROC_SPAWN",
            Self::ProcSuspend => "PROC_SUSPEND",
            Self::ProcResume => "PROC_RESUME",
            Self::NetConnect => "NET_CONNECT",
            Self::NetListen => "NET_LISTEN",
            Self::NetSecure => "NET_SECURE",
            Self::MemAlloc => "MEM_ALLOC",
            Self::MemMap => "MEM_MAP",
            Self::MemExec => "MEM_EXEC",
            Self::SysInfo => "SYS_INFO",
            Self::SysConfig => "SYS_CONFIG",
            Self::Destructive => "DESTRUCTIVE",
        }
    }
}

/// Soft signals of hostile intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Behavior {
    /// Loop without a bound.
    InfiniteLoop,
    /// Allocation inside a loop.
    MemoryBomb,
    /// `fork` inside a loop.
    ForkBomb,
    /// Escaped or numerically encoded text.
    Obfuscation,
    /// Base64-dense literals or dynamic evaluation.
    EncodedPayload,
    /// Shell metacharacters reaching a shell.
    ShellInjection,
    /// `..` path components.
    PathTraversal,
    /// Busy loops and descriptor exhaustion.
    ResourceExhaust,
    /// Destructive verb inside a loop body.
    LoopDestruction,
}

impl Behavior {
    /// Every behaviour in declaration order.
    pub const ALL: [Behavior; 9] = [
        Self::InfiniteLoop,
        Self::MemoryBomb,
        Self::ForkBomb,
        Self::Obfuscation,
        Self::EncodedPayload,
        Self::ShellInjection,
        Self::PathTraversal,
        Self::ResourceExhaust,
        Self::LoopDestruction,
    ];

    /// Bit in a [`BehaviorSet`].
    pub fn bit(self) -> u16 {
        1u16.wrapping_shl(self as u32)
    }

    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InfiniteLoop => "INFINITE_LOOP",
            Self::MemoryBomb => "MEMORY_BOMB",
            Self::ForkBomb => "FORK_BOMB",
            Self::Obfuscation => "OBFUSCATION",
            Self::EncodedPayload => "ENCODED_PAYLOAD",
            Self::ShellInjection => "SHELL_INJECTION",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::ResourceExhaust => "RESOURCE_EXHAUST",
            Self::LoopDestruction => "LOOP_DESTRUCTION",
        }
    }
}

macro_rules! flag_set {
    ($(#[$doc:meta])* $name:ident, $flag:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u16);

        impl $name {
            /// Empty set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Rebuild from raw bits, dropping unknown ones.
            pub fn from_bits(bits: u16) -> Self {
                let known = $flag::ALL.iter().fold(0u16, |acc, f| acc | f.bit());
                Self(bits & known)
            }

            /// Raw bits.
            pub fn bits(self) -> u16 {
                self.0
            }

            /// Add a member.
            pub fn insert(&mut self, flag: $flag) {
                self.0 |= flag.bit();
            }

            /// Membership test.
            pub fn contains(self, flag: $flag) -> bool {
                self.0 & flag.bit() != 0
            }

            /// Whether no member is set.
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Members in declaration order.
            pub fn iter(self) -> impl Iterator<Item = $flag> {
                $flag::ALL.into_iter().filter(move |f| self.contains(*f))
            }

            /// Member names in declaration order.
            pub fn names(self) -> Vec<&'static str> {
                self.iter().map($flag::as_str).collect()
            }
        }

        impl FromIterator<$flag> for $name {
            fn from_iter<I: IntoIterator<Item = $flag>>(iter: I) -> Self {
                let mut set = Self::empty();
                for f in iter {
                    set.insert(f);
                }
                set
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_empty() {
                    return f.write_str("none");
                }
                f.write_str(&self.names().join(", "))
            }
        }
    };
}

flag_set!(
    /// Bitset of [`Capability`].
    CapSet,
    Capability
);

flag_set!(
    /// Bitset of [`Behavior`].
    BehaviorSet,
    Behavior
);

/// Ordered threat estimate.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    /// No capability of note.
    #[default]
    None,
    /// Low.
    Low,
    /// Medium.
    Medium,
    /// High.
    High,
    /// Critical.
    Critical,
}

impl ThreatLevel {
    /// Every level, lowest first.
    pub const ALL: [ThreatLevel; 5] = [
        Self::None,
        Self::Low,
        Self::Medium,
        Self::High,
        Self::Critical,
    ];

    /// Saturate an additive weight into a level.
    pub fn from_weight(weight: u32) -> Self {
        match weight {
            0 => Self::None,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Position in [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`index`](Self::index).
    pub fn from_index(index: u64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Capabilities exercised.
    pub caps: CapSet,
    /// Saturated threat level.
    pub threat: ThreatLevel,
    /// Behaviour flags raised.
    pub behaviors: BehaviorSet,
    /// Summed behaviour weights, capped at 100.
    pub score: u8,
}

/// Behaviour analysis with human-readable findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BehaviorReport {
    /// Flags raised.
    pub flags: BehaviorSet,
    /// Summed weights, capped at 100.
    pub score: u8,
    /// One line per raised flag, at most sixteen.
    pub descriptions: Vec<String>,
}

// ---------------------------------------------------------------------------
// Decisions
// ---------------------------------------------------------------------------

/// Outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    /// The request may run.
    Approve,
    /// The request may not run.
    Decline,
}

impl Decision {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Decline => "DECLINE",
        }
    }
}

/// Who made the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecidedBy {
    /// Automatic policy.
    Auto,
    /// The approval collaborator.
    User,
    /// A cached prior decision.
    Cache,
    /// Strict mode.
    StrictDeny,
}

impl DecidedBy {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::User => "USER",
            Self::Cache => "CACHE",
            Self::StrictDeny => "STRICT_DENY",
        }
    }
}

/// Why a request was declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// Carried the destructive capability.
    Destructive,
    /// Strict mode threshold reached.
    Strict,
    /// Approval deadline elapsed.
    ApprovalTimeout,
    /// The approval collaborator said no.
    UserDeclined,
    /// Interactive mode with no approval collaborator available.
    NoApprover,
}

/// Interactive or automatic evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Ask the approval collaborator.
    Interactive,
    /// Decide without asking.
    Automatic,
}

/// A committed governor decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Request fingerprint.
    pub fingerprint: Digest,
    /// Requested name.
    pub name: String,
    /// Capabilities.
    pub caps: CapSet,
    /// Threat level.
    pub threat: ThreatLevel,
    /// Behaviour flags.
    pub behaviors: BehaviorSet,
    /// Behaviour score.
    pub score: u8,
    /// Outcome.
    pub decision: Decision,
    /// Human-readable summary, at most 200 characters.
    pub summary: String,
    /// Safer alternatives, only on decline.
    pub alternatives: Option<String>,
    /// Decision maker.
    pub decided_by: DecidedBy,
    /// Decline reason.
    pub reason: Option<DeclineReason>,
    /// Commit tick.
    pub created_at: Tick,
    /// Whether the decision is still inside the rollback window.
    pub can_rollback: bool,
    /// Fingerprint committed to the cache just before this one.
    pub prior_fingerprint: Option<Digest>,
    /// Policy epoch the decision was made under.
    pub policy_epoch: u64,
}

impl DecisionRecord {
    /// Hash of the canonical encoding, used as the audit `after_hash`.
    pub fn content_hash(&self) -> Digest {
        let mut w = CanonicalWriter::new("phantom.governor.decision");
        w.put_digest(&self.fingerprint)
            .put_str(&self.name)
            .put_u32(u32::from(self.caps.bits()))
            .put_u8(u8::try_from(self.threat.index()).unwrap_or(u8::MAX))
            .put_u32(u32::from(self.behaviors.bits()))
            .put_u8(self.score)
            .put_str(self.decision.as_str())
            .put_str(&self.summary)
            .put_str(self.alternatives.as_deref().unwrap_or(""))
            .put_str(self.decided_by.as_str())
            .put_u64(self.created_at)
            .put_bool(self.can_rollback)
            .put_u64(self.policy_epoch);
        match &self.prior_fingerprint {
            Some(d) => w.put_u8(1).put_digest(d),
            None => w.put_u8(0),
        };
        w.digest()
    }
}

/// Decision plus the audit sequence number it was committed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    /// The decision.
    pub record: DecisionRecord,
    /// Sequence number of the `decision_committed` audit event.
    pub audit_seq: u64,
}

impl Evaluation {
    /// Whether the request was approved.
    pub fn is_approved(&self) -> bool {
        self.record.decision == Decision::Approve
    }

    /// Error kind a caller should surface for a decline.
    pub fn decline_kind(&self) -> Option<ErrorKind> {
        if self.is_approved() {
            return None;
        }
        Some(match self.record.reason {
            Some(DeclineReason::Destructive) => ErrorKind::DestructiveDenied,
            Some(DeclineReason::Strict) => ErrorKind::StrictDenied,
            Some(DeclineReason::ApprovalTimeout) => ErrorKind::ApprovalTimeout,
            Some(DeclineReason::UserDeclined | DeclineReason::NoApprover) | None => {
                ErrorKind::Declined
            }
        })
    }

    /// Turn a decline into the matching error.
    ///
    /// # Errors
    ///
    /// Returns the error corresponding to [`decline_kind`](Self::decline_kind).
    pub fn ensure_approved(self) -> Result<Self, CoreError> {
        let name = self.record.name.clone();
        match self.decline_kind() {
            None => Ok(self),
            Some(ErrorKind::DestructiveDenied) => Err(CoreError::DestructiveDenied { name }),
            Some(ErrorKind::StrictDenied) => Err(CoreError::StrictDenied { name }),
            Some(ErrorKind::ApprovalTimeout) => Err(CoreError::ApprovalTimeout { name }),
            Some(_) => Err(CoreError::Declined { name }),
        }
    }
}

/// Governor counters.
///
/// `auto_approved`, `user_approved`, `user_declined` and `auto_declined`
/// partition `evaluations`. A strict denial or an approval timeout is an
/// automatic decline, so it counts in `auto_declined` and again in its
/// sub-counter. Adding `strict_denied` and `approval_timeouts` on top of the
/// four buckets therefore gives `evaluations + strict_denied +
/// approval_timeouts`, not `evaluations`; use [`total_decisions`] for the
/// total.
///
/// [`total_decisions`]: Self::total_decisions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GovernorStats {
    /// Evaluate calls committed.
    pub evaluations: u64,
    /// Approved automatically or from cache.
    pub auto_approved: u64,
    /// Approved by the collaborator.
    pub user_approved: u64,
    /// Declined by the collaborator.
    pub user_declined: u64,
    /// Declined automatically, by strict mode, or from cache.
    pub auto_declined: u64,
    /// Of `auto_declined`: strict-mode denials.
    pub strict_denied: u64,
    /// Of `auto_declined`: approval timeouts.
    pub approval_timeouts: u64,
    /// Of `auto_declined`: destructive denials.
    pub destructive_denied: u64,
    /// Requests at NONE threat.
    pub threats_none: u64,
    /// Requests at LOW threat.
    pub threats_low: u64,
    /// Requests at MEDIUM threat.
    pub threats_medium: u64,
    /// Requests at HIGH threat.
    pub threats_high: u64,
    /// Requests at CRITICAL threat.
    pub threats_critical: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Most recent decision, if any.
    pub last_decision: Option<(Decision, DecidedBy, Option<DeclineReason>)>,
    /// Tick of the most recent evaluation.
    pub last_scan_tick: Option<Tick>,
}

impl GovernorStats {
    /// Sum of the four exclusive outcome buckets; equals `evaluations`.
    pub fn total_decisions(&self) -> u64 {
        self.auto_approved
            .saturating_add(self.user_approved)
            .saturating_add(self.user_declined)
            .saturating_add(self.auto_declined)
    }

    /// Sum of the five threat buckets; equals `evaluations`.
    pub fn total_threats(&self) -> u64 {
        self.threats_none
            .saturating_add(self.threats_low)
            .saturating_add(self.threats_medium)
            .saturating_add(self.threats_high)
            .saturating_add(self.threats_critical)
    }

    pub(crate) fn bump_threat(&mut self, threat: ThreatLevel) {
        let bucket = match threat {
            ThreatLevel::None => &mut self.threats_none,
            ThreatLevel::Low => &mut self.threats_low,
            ThreatLevel::Medium => &mut self.threats_medium,
            ThreatLevel::High => &mut self.threats_high,
            ThreatLevel::Critical => &mut self.threats_critical,
        };
        *bucket = bucket.saturating_add(1);
    }
}

/// Truncate to at most [`SUMMARY_MAX`] characters.
pub(crate) fn clip(s: String) -> String {
    if s.chars().count() <= SUMMARY_MAX {
        return s;
    }
    s.chars().take(SUMMARY_MAX).collect()
}

/// Comma-separated capability names, `"none"` when empty.
pub fn caps_to_list(caps: CapSet) -> String {
    caps.to_string()
}
