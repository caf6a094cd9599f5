//! Geology: the append-only, hash-chained audit log shared by every core.
//!
//! Each event carries the hash of its predecessor's canonical encoding, so
//! the whole history can be re-verified from the first frame. Events are
//! chained eagerly under the log's lock; the chain head is always the hash
//! of the newest event.
//!
//! The log is the system of record: governor, DNAuth and QRNet append
//! before they touch their own state, and hand the returned sequence number
//! back to their caller.

pub mod sink;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, Tick};
use crate::crypto::canonical::{CanonicalReader, CanonicalWriter};
use crate::crypto::{hash, Digest};
use crate::error::CoreError;

pub use sink::{replay, AuditSink, FrameSink};

const EVENT_TAG: &str = "phantom.geology.event";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Governor committed a decision.
    DecisionCommitted,
    /// Governor mode, strict flag, or cache flag changed.
    PolicyChanged,
    /// Decision cache cleared.
    CacheCleared,
    /// One cached decision invalidated.
    CacheInvalidated,
    /// DNAuth user registered.
    UserRegistered,
    /// DNAuth authentication succeeded.
    AuthSucceeded,
    /// DNAuth authentication failed.
    AuthFailed,
    /// DNAuth user locked out after repeated failures.
    UserLockedOut,
    /// DNAuth key evolved to a new generation.
    KeyEvolved,
    /// DNAuth key replaced by the user.
    KeyChanged,
    /// DNAuth user revoked.
    UserRevoked,
    /// QRNet code created.
    CodeCreated,
    /// QRNet code verified successfully.
    CodeVerified,
    /// QRNet code failed verification.
    CodeVerifyFailed,
    /// QRNet code revoked.
    CodeRevoked,
    /// QRNet code superseded by a new code.
    CodeSuperseded,
    /// QRNet code passed its expiry.
    CodeExpired,
    /// Content published into the QRNet content store.
    ContentPublished,
}

impl EventKind {
    const ALL: [EventKind; 18] = [
        Self::DecisionCommitted,
        Self::PolicyChanged,
        Self::CacheCleared,
        Self::CacheInvalidated,
        Self::UserRegistered,
        Self::AuthSucceeded,
        Self::AuthFailed,
        Self::UserLockedOut,
        Self::KeyEvolved,
        Self::KeyChanged,
        Self::UserRevoked,
        Self::CodeCreated,
        Self::CodeVerified,
        Self::CodeVerifyFailed,
        Self::CodeRevoked,
        Self::CodeSuperseded,
        Self::CodeExpired,
        Self::ContentPublished,
    ];

    /// Stable snake_case name, used in the canonical encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DecisionCommitted => "decision_committed",
            Self::PolicyChanged => "policy_changed",
            Self::CacheCleared => "cache_cleared",
            Self::CacheInvalidated => "cache_invalidated",
            Self::UserRegistered => "user_registered",
            Self::AuthSucceeded => "auth_succeeded",
            Self::AuthFailed => "auth_failed",
            Self::UserLockedOut => "user_locked_out",
            Self::KeyEvolved => "key_evolved",
            Self::KeyChanged => "key_changed",
            Self::UserRevoked => "user_revoked",
            Self::CodeCreated => "code_created",
            Self::CodeVerified => "code_verified",
            Self::CodeVerifyFailed => "code_verify_failed",
            Self::CodeRevoked => "code_revoked",
            Self::CodeSuperseded => "code_superseded",
            Self::CodeExpired => "code_expired",
            Self::ContentPublished => "content_published",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One committed audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the log, starting at zero.
    pub seq: u64,
    /// Event type.
    pub kind: EventKind,
    /// Primary subject (fingerprint hex, user id, code id).
    pub subject: String,
    /// Content hash of the previous event, or zero for the first.
    pub before_hash: Digest,
    /// Hash of the record state produced by the operation.
    pub after_hash: Digest,
    /// JSON payload bytes.
    pub payload: Vec<u8>,
    /// Tick at which the event was appended.
    pub tick: Tick,
}

impl AuditEvent {
    /// Canonical encoding; the frame payload on disk.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut w = CanonicalWriter::new(EVENT_TAG);
        w.put_u64(self.seq)
            .put_str(self.kind.as_str())
            .put_str(&self.subject)
            .put_digest(&self.before_hash)
            .put_digest(&self.after_hash)
            .put_bytes(&self.payload)
            .put_u64(self.tick);
        w.finish()
    }

    /// Hash of the canonical encoding; the next event's `before_hash`.
    pub fn content_hash(&self) -> Digest {
        hash(&self.canonical_bytes())
    }

    /// Decode a canonical encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let mut r = CanonicalReader::new(bytes, EVENT_TAG)?;
        let seq = r.get_u64()?;
        let kind_name = r.get_str()?;
        let kind = EventKind::parse(&kind_name)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown event kind {kind_name}")))?;
        let event = Self {
            seq,
            kind,
            subject: r.get_str()?,
            before_hash: r.get_digest()?,
            after_hash: r.get_digest()?,
            payload: r.get_bytes()?,
            tick: r.get_u64()?,
        };
        r.finish()?;
        Ok(event)
    }

    /// Payload parsed as JSON, if it is JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Event content supplied by a caller; the log fills in seq, chain and tick.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event type.
    pub kind: EventKind,
    /// Primary subject.
    pub subject: String,
    /// Hash of the record state the operation produces.
    pub after_hash: Digest,
    /// Structured payload.
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Event with no state hash and an empty payload.
    pub fn new(kind: EventKind, subject: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            after_hash: Digest::ZERO,
            payload: serde_json::Value::Null,
        }
    }

    /// Set the post-operation state hash.
    pub fn after(mut self, after_hash: Digest) -> Self {
        self.after_hash = after_hash;
        self
    }

    /// Set the payload.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Check sequence numbers and hash links of `events`, returning the head hash.
///
/// # Errors
///
/// Returns [`CoreError::InvalidInput`] naming the first broken link.
pub fn verify_chain(events: &[AuditEvent]) -> Result<Digest, CoreError> {
    let mut head = Digest::ZERO;
    for (index, event) in (0u64..).zip(events.iter()) {
        if event.seq != index {
            return Err(CoreError::InvalidInput(format!(
                "event at position {index} has seq {}",
                event.seq
            )));
        }
        if event.before_hash != head {
            return Err(CoreError::InvalidInput(format!(
                "chain broken at seq {index}"
            )));
        }
        head = event.content_hash();
    }
    Ok(head)
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

struct LogState {
    events: Vec<AuditEvent>,
    head: Digest,
    sink: Option<Box<dyn AuditSink>>,
    durable: bool,
    healthy: bool,
    flushed_through: Option<u64>,
}

/// The shared audit log.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
/// Callers hold their own component lock while appending; the log's lock is
/// always the innermost one.
pub struct AuditLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AuditLog")
            .field("len", &state.events.len())
            .field("head", &state.head)
            .field("durable", &state.durable)
            .field("healthy", &state.healthy)
            .finish()
    }
}

impl AuditLog {
    /// Memory-only log.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::from_parts(clock, Vec::new(), Digest::ZERO, None, false)
    }

    /// Log that forwards every event to `sink`.
    ///
    /// With `durable`, each append is flushed before it is acknowledged.
    pub fn with_sink(clock: Arc<dyn Clock>, sink: Box<dyn AuditSink>, durable: bool) -> Self {
        Self::from_parts(clock, Vec::new(), Digest::ZERO, Some(sink), durable)
    }

    /// Open a PHGL file, replaying and verifying any existing events.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the file cannot be read or
    /// written, and [`CoreError::InvalidInput`] if the stored chain is broken.
    pub fn open(path: &Path, clock: Arc<dyn Clock>, durable: bool) -> Result<Self, CoreError> {
        let (events, sink) = if path.exists() {
            let events = replay(path)?;
            let sink = FrameSink::append_to(path)
                .map_err(|e| CoreError::AuditFailure(format!("{}: {e}", path.display())))?;
            (events, sink)
        } else {
            let sink = FrameSink::create(path)
                .map_err(|e| CoreError::AuditFailure(format!("{}: {e}", path.display())))?;
            (Vec::new(), sink)
        };
        let head = verify_chain(&events)?;
        debug!(path = %path.display(), events = events.len(), "geology opened");
        Ok(Self::from_parts(
            clock,
            events,
            head,
            Some(Box::new(sink)),
            durable,
        ))
    }

    fn from_parts(
        clock: Arc<dyn Clock>,
        events: Vec<AuditEvent>,
        head: Digest,
        sink: Option<Box<dyn AuditSink>>,
        durable: bool,
    ) -> Self {
        let flushed_through = events.len().checked_sub(1).and_then(|i| u64::try_from(i).ok());
        Self {
            state: Mutex::new(LogState {
                events,
                head,
                sink,
                durable,
                healthy: true,
                flushed_through,
            }),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event and return its sequence number.
    ///
    /// Nothing is retained if the sink rejects the frame; the log then
    /// reports unhealthy and refuses further appends.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the log is unhealthy or the
    /// sink fails.
    pub fn append(&self, new: NewEvent) -> Result<u64, CoreError> {
        let mut state = self.lock();
        if !state.healthy {
            return Err(CoreError::AuditFailure(
                "audit log is unhealthy".to_owned(),
            ));
        }
        let seq = u64::try_from(state.events.len())
            .map_err(|_| CoreError::AuditFailure("sequence space exhausted".to_owned()))?;
        let payload = serde_json::to_vec(&new.payload)
            .map_err(|e| CoreError::AuditFailure(format!("payload encoding: {e}")))?;
        let event = AuditEvent {
            seq,
            kind: new.kind,
            subject: new.subject,
            before_hash: state.head,
            after_hash: new.after_hash,
            payload,
            tick: self.clock.now(),
        };

        let durable = state.durable;
        if let Some(sink) = state.sink.as_mut() {
            let written = sink
                .append(&event)
                .and_then(|()| if durable { sink.flush(seq) } else { Ok(()) });
            if let Err(e) = written {
                if let Err(discard) = sink.discard_after(seq.checked_sub(1)) {
                    warn!(seq, error = %discard, "audit sink kept a rejected frame");
                }
                state.healthy = false;
                warn!(seq, kind = %event.kind, error = %e, "audit sink rejected event");
                return Err(CoreError::AuditFailure(e.to_string()));
            }
            if durable {
                state.flushed_through = Some(seq);
            }
        }

        state.head = event.content_hash();
        debug!(seq, kind = %event.kind, subject = %event.subject, "audit event appended");
        state.events.push(event);
        Ok(seq)
    }

    /// Make every event up to and including `up_to_seq` durable.
    ///
    /// A memory-only log has nothing to flush and succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the sink cannot flush.
    pub fn flush(&self, up_to_seq: u64) -> Result<(), CoreError> {
        let mut state = self.lock();
        let last = state.events.len().checked_sub(1).and_then(|i| u64::try_from(i).ok());
        let target = match last {
            Some(last) => up_to_seq.min(last),
            None => return Ok(()),
        };
        if state.flushed_through.is_some_and(|f| f >= target) {
            return Ok(());
        }
        if let Some(sink) = state.sink.as_mut() {
            if let Err(e) = sink.flush(target) {
                state.healthy = false;
                warn!(up_to_seq, error = %e, "audit flush failed");
                return Err(CoreError::AuditFailure(e.to_string()));
            }
        }
        state.flushed_through = Some(target);
        Ok(())
    }

    /// Flush everything appended so far.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the sink cannot flush.
    pub fn flush_all(&self) -> Result<(), CoreError> {
        self.flush(u64::MAX)
    }

    /// Events with `from <= seq < to`.
    pub fn read_range(&self, from: u64, to: u64) -> Vec<AuditEvent> {
        let state = self.lock();
        let len = state.events.len();
        let start = usize::try_from(from).unwrap_or(len).min(len);
        let end = usize::try_from(to).unwrap_or(len).min(len);
        state
            .events
            .get(start..end.max(start))
            .map(<[AuditEvent]>::to_vec)
            .unwrap_or_default()
    }

    /// The newest `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<AuditEvent> {
        let state = self.lock();
        let start = state.events.len().saturating_sub(n);
        state.events.get(start..).map(<[AuditEvent]>::to_vec).unwrap_or_default()
    }

    /// Event at `seq`.
    pub fn get(&self, seq: u64) -> Option<AuditEvent> {
        let state = self.lock();
        usize::try_from(seq).ok().and_then(|i| state.events.get(i).cloned())
    }

    /// Content hash of the newest event, or zero for an empty log.
    pub fn head_hash(&self) -> Digest {
        self.lock().head
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Whether the log has no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether appends are currently accepted.
    pub fn is_healthy(&self) -> bool {
        self.lock().healthy
    }

    /// Try to bring an unhealthy log back by flushing its sink.
    ///
    /// Frames of rejected events are discarded first, so the sink never
    /// holds two frames with the same sequence number.
    ///
    /// Returns whether the log is healthy afterwards.
    pub fn recover(&self) -> bool {
        let mut state = self.lock();
        if state.healthy {
            return true;
        }
        let last = state.events.len().checked_sub(1).and_then(|i| u64::try_from(i).ok());
        // Only acknowledged events may reach the sink.
        let flushed = match (state.sink.as_mut(), last) {
            (Some(sink), Some(last)) => {
                sink.discard_after(Some(last)).is_ok() && sink.flush(last).is_ok()
            }
            (Some(sink), None) => sink.discard_after(None).is_ok(),
            (None, _) => true,
        };
        state.healthy = flushed;
        flushed
    }

    /// Re-verify the in-memory chain.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] naming the first broken link.
    pub fn verify_chain(&self) -> Result<Digest, CoreError> {
        let state = self.lock();
        let head = verify_chain(&state.events)?;
        if head != state.head {
            return Err(CoreError::InvalidInput("head hash mismatch".to_owned()));
        }
        Ok(head)
    }
}
