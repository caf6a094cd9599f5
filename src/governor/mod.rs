//! Governor: decides whether a piece of code may run.
//!
//! Each evaluation classifies the request text, consults the decision cache,
//! applies strict mode, optionally asks an approval collaborator, and commits
//! the result to the audit log before updating counters, cache and history.
//! A request is never partially committed: if the audit append fails, or the
//! caller cancels first, nothing changes.
//!
//! The governor's state version increments on every policy change and is
//! embedded in QRNet codes; see [`PolicyVersion`].

pub mod approval;
pub mod cache;
pub mod classifier;
pub mod patterns;
pub mod types;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::config::GovernorConfig;
use crate::crypto::Digest;
use crate::error::CoreError;
use crate::geology::{AuditLog, EventKind, NewEvent};

use approval::{ApprovalRequest, ApprovalVerdict, Approver};
use cache::{CacheStats, DecisionCache};
use classifier::{fingerprint, normalize, Classifier};
use types::{
    clip, BehaviorReport, Capability, Classification, DecidedBy, Decision, DeclineReason,
    DecisionRecord, Evaluation, GovernorStats, Mode, ThreatLevel,
};

/// Read-only view of the governor state version.
pub trait PolicyVersion: Send + Sync {
    /// Current governor state version.
    fn state_version(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A code request to evaluate.
#[derive(Clone, Default)]
pub struct EvalRequest {
    /// Source text.
    pub text: String,
    /// Requested name.
    pub name: String,
    /// Approval collaborator for this call; falls back to the governor's default.
    pub approver: Option<Arc<dyn Approver>>,
    /// Approval deadline; falls back to the configured timeout.
    pub deadline: Option<Duration>,
    /// Cancellation token for the approval wait.
    pub cancel: Option<CancelToken>,
    /// Overrides the governor mode for this call.
    pub mode: Option<Mode>,
    /// Whether a collaborator decline may be cached.
    pub cache_declines: bool,
}

impl std::fmt::Debug for EvalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalRequest")
            .field("name", &self.name)
            .field("text_len", &self.text.len())
            .field("has_approver", &self.approver.is_some())
            .field("deadline", &self.deadline)
            .field("mode", &self.mode)
            .finish()
    }
}

impl EvalRequest {
    /// Request for `text` under `name`.
    pub fn new(text: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: name.into(),
            cache_declines: true,
            ..Self::default()
        }
    }

    /// Use `approver` for this call.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Bound the approval wait.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Cancel the approval wait when `token` fires.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Override the governor mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Do not cache a collaborator decline.
    pub fn no_cache_on_decline(mut self) -> Self {
        self.cache_declines = false;
        self
    }
}

/// One committed decision in the history window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The decision as it stands now (`can_rollback` ages out).
    pub record: DecisionRecord,
    /// Audit sequence number of the commit.
    pub audit_seq: u64,
}

/// Result of a policy setting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyChange {
    /// State version after the call.
    pub state_version: u64,
    /// Audit sequence number, if the setting actually changed.
    pub audit_seq: Option<u64>,
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

struct GovernorState {
    mode: Mode,
    strict: bool,
    cache: DecisionCache,
    policy_epoch: u64,
    stats: GovernorStats,
    history: VecDeque<HistoryEntry>,
}

/// Outcome chosen before commit.
struct Verdict {
    decision: Decision,
    decided_by: DecidedBy,
    reason: Option<DeclineReason>,
    summary: String,
    alternatives: Option<String>,
}

/// Snapshot taken under the lock before any await.
struct Plan {
    epoch: u64,
    cache_checked: bool,
    cache_hit: Option<DecisionRecord>,
    immediate: Option<Verdict>,
    ask: Option<Arc<dyn Approver>>,
}

/// The policy engine.
///
/// Uses a sync [`Mutex`] since no critical section spans an await; the
/// approval wait happens with the lock released.
pub struct Governor {
    classifier: Classifier,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    config: GovernorConfig,
    default_approver: Option<Arc<dyn Approver>>,
    state_version: AtomicU64,
    state: Mutex<GovernorState>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("state_version", &self.state_version())
            .field("classifier", &self.classifier)
            .finish()
    }
}

impl Governor {
    /// Create a governor with settings from `config`.
    pub fn new(
        config: GovernorConfig,
        classifier: Classifier,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut cache = DecisionCache::new(config.cache_capacity);
        cache.set_enabled(config.cache_enabled);
        let mode = if config.interactive {
            Mode::Interactive
        } else {
            Mode::Automatic
        };
        Self {
            state: Mutex::new(GovernorState {
                mode,
                strict: config.strict,
                cache,
                policy_epoch: 0,
                stats: GovernorStats::default(),
                history: VecDeque::new(),
            }),
            classifier,
            audit,
            clock,
            config,
            default_approver: None,
            state_version: AtomicU64::new(1),
        }
    }

    /// Use `approver` when a request does not bring its own.
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.default_approver = Some(approver);
        self
    }

    fn lock(&self) -> MutexGuard<'_, GovernorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classifier in use.
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Classify without deciding.
    pub fn classify(&self, text: &str, name: &str) -> Classification {
        self.classifier.classify(text, name)
    }

    /// Behaviour flags, score, and findings for `text`.
    pub fn behavioral_analyze(&self, text: &str) -> BehaviorReport {
        self.classifier.analyze_behavior(text)
    }

    /// Evaluate a request.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] for empty text.
    /// - [`CoreError::Cancelled`] if the token fires before commit.
    /// - [`CoreError::AuditFailure`] if the decision could not be logged;
    ///   counters, cache and history are then unchanged.
    pub async fn evaluate(&self, request: EvalRequest) -> Result<Evaluation, CoreError> {
        if normalize(&request.text).is_empty() {
            return Err(CoreError::InvalidInput("empty request text".to_owned()));
        }
        let fp = fingerprint(&request.text, &request.name);
        let class = self.classifier.classify(&request.text, &request.name);
        debug!(
            name = %request.name,
            fingerprint = %fp.short(),
            caps = %class.caps,
            threat = %class.threat,
            score = class.score,
            "request classified"
        );

        let plan = self.plan(&request, &fp, &class);

        let verdict = match (plan.immediate, plan.ask) {
            (Some(v), _) => v,
            (None, Some(approver)) => {
                self.ask_approver(approver.as_ref(), &request, &fp, &class)
                    .await?
            }
            (None, None) => approve_auto(&request.name, class.threat),
        };

        if request.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(CoreError::Cancelled);
        }

        self.commit(
            &request,
            fp,
            class,
            plan.epoch,
            plan.cache_checked,
            plan.cache_hit,
            verdict,
        )
    }

    fn plan(&self, request: &EvalRequest, fp: &Digest, class: &Classification) -> Plan {
        let state = self.lock();
        let epoch = state.policy_epoch;

        if class.caps.contains(Capability::Destructive) {
            let alternatives = clip(self.classifier.alternatives_text(&request.text));
            return Plan {
                epoch,
                cache_checked: false,
                cache_hit: None,
                immediate: Some(Verdict {
                    decision: Decision::Decline,
                    decided_by: DecidedBy::Auto,
                    reason: Some(DeclineReason::Destructive),
                    summary: "destructive capability".to_owned(),
                    alternatives: Some(alternatives),
                }),
                ask: None,
            };
        }

        let cached = state
            .cache
            .peek(fp, epoch)
            .filter(|r| r.caps == class.caps && r.threat == class.threat)
            .cloned();
        if let Some(record) = cached {
            return Plan {
                epoch,
                cache_checked: true,
                immediate: Some(Verdict {
                    decision: record.decision,
                    decided_by: DecidedBy::Cache,
                    reason: record.reason,
                    summary: record.summary.clone(),
                    alternatives: record.alternatives.clone(),
                }),
                cache_hit: Some(record),
                ask: None,
            };
        }

        let strict_hit = state.strict
            && (class.threat >= ThreatLevel::High
                || class.score >= self.config.strict_score_threshold);
        if strict_hit {
            return Plan {
                epoch,
                cache_checked: true,
                cache_hit: None,
                immediate: Some(Verdict {
                    decision: Decision::Decline,
                    decided_by: DecidedBy::StrictDeny,
                    reason: Some(DeclineReason::Strict),
                    summary: clip(format!(
                        "Declined: {} (strict mode, threat: {}, score: {})",
                        request.name, class.threat, class.score
                    )),
                    alternatives: None,
                }),
                ask: None,
            };
        }

        let mode = request.mode.unwrap_or(state.mode);
        if mode == Mode::Interactive {
            let approver = request
                .approver
                .clone()
                .or_else(|| self.default_approver.clone());
            let immediate = approver.is_none().then(|| Verdict {
                decision: Decision::Decline,
                decided_by: DecidedBy::Auto,
                reason: Some(DeclineReason::NoApprover),
                summary: clip(format!("Declined: {} (no approver available)", request.name)),
                alternatives: None,
            });
            return Plan {
                epoch,
                cache_checked: true,
                cache_hit: None,
                immediate,
                ask: approver,
            };
        }

        Plan {
            epoch,
            cache_checked: true,
            cache_hit: None,
            immediate: None,
            ask: None,
        }
    }

    async fn ask_approver(
        &self,
        approver: &dyn Approver,
        request: &EvalRequest,
        fp: &Digest,
        class: &Classification,
    ) -> Result<Verdict, CoreError> {
        let ask = ApprovalRequest {
            fingerprint: *fp,
            name: request.name.clone(),
            classification: *class,
            summary: clip(format!(
                "{} wants {} (threat: {})",
                request.name, class.caps, class.threat
            )),
        };
        let deadline = request
            .deadline
            .unwrap_or(Duration::from_millis(self.config.approval_timeout_ms));

        let waited = match &request.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => return Err(CoreError::Cancelled),
                    v = tokio::time::timeout(deadline, approver.ask(&ask)) => v,
                }
            }
            None => tokio::time::timeout(deadline, approver.ask(&ask)).await,
        };
        let verdict = waited.unwrap_or(ApprovalVerdict::Timeout);

        Ok(match verdict {
            ApprovalVerdict::Approve => Verdict {
                decision: Decision::Approve,
                decided_by: DecidedBy::User,
                reason: None,
                summary: clip(format!(
                    "Approved by user: {} (threat: {})",
                    request.name, class.threat
                )),
                alternatives: None,
            },
            ApprovalVerdict::Decline => Verdict {
                decision: Decision::Decline,
                decided_by: DecidedBy::User,
                reason: Some(DeclineReason::UserDeclined),
                summary: clip(format!("Declined by user: {}", request.name)),
                alternatives: None,
            },
            ApprovalVerdict::Timeout => {
                warn!(name = %request.name, ?deadline, "approval timeout");
                Verdict {
                    decision: Decision::Decline,
                    decided_by: DecidedBy::Auto,
                    reason: Some(DeclineReason::ApprovalTimeout),
                    summary: "approval timeout".to_owned(),
                    alternatives: None,
                }
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        request: &EvalRequest,
        fp: Digest,
        class: Classification,
        epoch: u64,
        cache_checked: bool,
        cache_hit: Option<DecisionRecord>,
        verdict: Verdict,
    ) -> Result<Evaluation, CoreError> {
        let mut state = self.lock();
        let record = DecisionRecord {
            fingerprint: fp,
            name: request.name.clone(),
            caps: class.caps,
            threat: class.threat,
            behaviors: class.behaviors,
            score: class.score,
            decision: verdict.decision,
            summary: verdict.summary,
            alternatives: match verdict.decision {
                Decision::Decline => verdict.alternatives,
                Decision::Approve => None,
            },
            decided_by: verdict.decided_by,
            reason: verdict.reason,
            created_at: self.clock.now(),
            can_rollback: verdict.decision == Decision::Approve,
            prior_fingerprint: state.cache.last_inserted(),
            policy_epoch: epoch,
        };

        let audit_seq = self.audit.append(
            NewEvent::new(EventKind::DecisionCommitted, fp.to_hex())
                .after(record.content_hash())
                .payload(json!({
                    "name": record.name,
                    "decision": record.decision,
                    "decided_by": record.decided_by,
                    "reason": record.reason,
                    "caps": record.caps.names(),
                    "threat": record.threat,
                    "threat_index": record.threat.index(),
                    "behaviors": record.behaviors.names(),
                    "score": record.score,
                    "policy_epoch": epoch,
                })),
        )?;

        // Committed: counters, cache, history.
        let stats = &mut state.stats;
        stats.evaluations = stats.evaluations.saturating_add(1);
        let bucket = match (record.decision, record.decided_by) {
            (Decision::Approve, DecidedBy::User) => &mut stats.user_approved,
            (Decision::Decline, DecidedBy::User) => &mut stats.user_declined,
            (Decision::Approve, _) => &mut stats.auto_approved,
            (Decision::Decline, _) => &mut stats.auto_declined,
        };
        *bucket = bucket.saturating_add(1);
        if record.decided_by != DecidedBy::Cache {
            let sub = match record.reason {
                Some(DeclineReason::Strict) => Some(&mut stats.strict_denied),
                Some(DeclineReason::ApprovalTimeout) => Some(&mut stats.approval_timeouts),
                Some(DeclineReason::Destructive) => Some(&mut stats.destructive_denied),
                _ => None,
            };
            if let Some(sub) = sub {
                *sub = sub.saturating_add(1);
            }
        }
        stats.bump_threat(record.threat);
        stats.last_decision = Some((record.decision, record.decided_by, record.reason));
        stats.last_scan_tick = Some(record.created_at);
        if cache_checked {
            let hit = cache_hit.is_some();
            let counter = if hit {
                &mut stats.cache_hits
            } else {
                &mut stats.cache_misses
            };
            *counter = counter.saturating_add(1);
            state.cache.record_lookup(hit);
        }

        let user_decline = record.decided_by == DecidedBy::User && record.decision == Decision::Decline;
        // A policy change between plan and commit makes this record stale.
        let cacheable = cache_checked
            && cache_hit.is_none()
            && epoch == state.policy_epoch
            && !(user_decline && !request.cache_declines);
        if cacheable {
            state.cache.insert(fp, record.clone(), epoch);
        }

        state.history.push_back(HistoryEntry {
            record: record.clone(),
            audit_seq,
        });
        while state.history.len() > self.config.history_capacity {
            state.history.pop_front();
        }
        let window = self.config.rollback_window;
        let len = state.history.len();
        if let Some(aged) = len
            .checked_sub(window.saturating_add(1))
            .and_then(|i| state.history.get_mut(i))
        {
            aged.record.can_rollback = false;
        }

        info!(
            name = %record.name,
            decision = record.decision.as_str(),
            decided_by = record.decided_by.as_str(),
            threat = %record.threat,
            audit_seq,
            "decision committed"
        );
        Ok(Evaluation { record, audit_seq })
    }

    // -----------------------------------------------------------------------
    // Policy settings
    // -----------------------------------------------------------------------

    fn change_policy(
        &self,
        setting: &str,
        value: serde_json::Value,
        bumps_epoch: bool,
        apply: impl FnOnce(&mut GovernorState) -> bool,
        changed: impl Fn(&GovernorState) -> bool,
    ) -> Result<PolicyChange, CoreError> {
        let mut state = self.lock();
        if !changed(&state) {
            return Ok(PolicyChange {
                state_version: self.state_version(),
                audit_seq: None,
            });
        }
        let next_version = self.state_version().saturating_add(1);
        let audit_seq = self.audit.append(
            NewEvent::new(EventKind::PolicyChanged, setting).payload(json!({
                "setting": setting,
                "value": value,
                "state_version": next_version,
            })),
        )?;
        apply(&mut state);
        if bumps_epoch {
            state.policy_epoch = state.policy_epoch.saturating_add(1);
        }
        self.state_version.store(next_version, Ordering::SeqCst);
        info!(setting, %value, state_version = next_version, "governor policy changed");
        Ok(PolicyChange {
            state_version: next_version,
            audit_seq: Some(audit_seq),
        })
    }

    /// Switch between interactive and automatic evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the change could not be logged.
    pub fn set_mode(&self, mode: Mode) -> Result<PolicyChange, CoreError> {
        self.change_policy(
            "mode",
            json!(mode),
            true,
            |s| {
                s.mode = mode;
                true
            },
            |s| s.mode != mode,
        )
    }

    /// Turn strict mode on or off.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the change could not be logged.
    pub fn set_strict(&self, strict: bool) -> Result<PolicyChange, CoreError> {
        self.change_policy(
            "strict",
            json!(strict),
            true,
            |s| {
                s.strict = strict;
                true
            },
            |s| s.strict != strict,
        )
    }

    /// Enable or disable cache lookups. Stored entries are kept.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the change could not be logged.
    pub fn enable_cache(&self, enabled: bool) -> Result<PolicyChange, CoreError> {
        self.change_policy(
            "cache_enabled",
            json!(enabled),
            false,
            |s| {
                s.cache.set_enabled(enabled);
                true
            },
            |s| s.cache.is_enabled() != enabled,
        )
    }

    /// Drop every cached decision.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the clear could not be logged.
    pub fn clear_cache(&self) -> Result<u64, CoreError> {
        let mut state = self.lock();
        let dropped = state.cache.stats().len;
        let seq = self.audit.append(
            NewEvent::new(EventKind::CacheCleared, "cache").payload(json!({ "dropped": dropped })),
        )?;
        state.cache.clear();
        debug!(dropped, "decision cache cleared");
        Ok(seq)
    }

    /// Drop one cached decision. Returns the audit sequence if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the invalidation could not be logged.
    pub fn invalidate(&self, fp: &Digest) -> Result<Option<u64>, CoreError> {
        let mut state = self.lock();
        if !state.cache.contains(fp) {
            return Ok(None);
        }
        let seq = self
            .audit
            .append(NewEvent::new(EventKind::CacheInvalidated, fp.to_hex()))?;
        state.cache.invalidate(fp);
        Ok(Some(seq))
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Committed decisions, newest first.
    pub fn history(&self, offset: usize, limit: usize) -> Vec<HistoryEntry> {
        self.lock()
            .history
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counters.
    pub fn stats(&self) -> GovernorStats {
        self.lock().stats.clone()
    }

    /// Cache counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.lock().cache.stats()
    }

    /// Current default mode.
    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Whether strict mode is on.
    pub fn is_strict(&self) -> bool {
        self.lock().strict
    }

    /// Whether cache lookups may hit.
    pub fn is_cache_enabled(&self) -> bool {
        self.lock().cache.is_enabled()
    }

    /// Current state version.
    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }
}

impl PolicyVersion for Governor {
    fn state_version(&self) -> u64 {
        Governor::state_version(self)
    }
}

fn approve_auto(name: &str, threat: ThreatLevel) -> Verdict {
    Verdict {
        decision: Decision::Approve,
        decided_by: DecidedBy::Auto,
        reason: None,
        summary: clip(format!("Approved: {name} (threat: {threat})")),
        alternatives: None,
    }
}
