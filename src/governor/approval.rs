//! Approval collaborators for interactive evaluation.
//!
//! The governor hands an [`ApprovalRequest`] to an [`Approver`] and waits
//! for a verdict under a deadline. [`QueuedApprover`] parks each request
//! under a short base62 identifier so that another task (a UI, a chat
//! bot) can answer it with [`QueuedApprover::resolve`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{oneshot, Notify};

use super::types::Classification;
use crate::crypto::Digest;

/// Length of generated approval identifiers.
const APPROVAL_ID_LEN: usize = 8;

/// Base62 alphabet used for approval IDs.
const BASE62_CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// What the collaborator is asked to decide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    /// Request fingerprint.
    pub fingerprint: Digest,
    /// Requested name.
    pub name: String,
    /// Classifier output.
    pub classification: Classification,
    /// One-line description for the approver.
    pub summary: String,
}

/// The collaborator's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerdict {
    /// Let the request run.
    Approve,
    /// Refuse the request.
    Decline,
    /// No answer could be obtained.
    Timeout,
}

/// External approval collaborator.
#[async_trait]
pub trait Approver: Send + Sync {
    /// Decide on `request`. The governor enforces its own deadline.
    async fn ask(&self, request: &ApprovalRequest) -> ApprovalVerdict;
}

/// Answers every request with the same verdict.
#[derive(Debug, Clone, Copy)]
pub struct FixedApprover(pub ApprovalVerdict);

#[async_trait]
impl Approver for FixedApprover {
    async fn ask(&self, _request: &ApprovalRequest) -> ApprovalVerdict {
        self.0
    }
}

/// A parked request awaiting [`QueuedApprover::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    /// Short base62 identifier.
    pub id: String,
    /// The request.
    pub request: ApprovalRequest,
}

struct Slot {
    pending: PendingApproval,
    reply: oneshot::Sender<bool>,
}

/// Result of resolving a parked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveResult {
    /// The verdict was delivered.
    Delivered,
    /// No request with that identifier is waiting.
    NotFound,
}

/// Parks requests until another task resolves them.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
#[derive(Default)]
pub struct QueuedApprover {
    pending: Mutex<HashMap<String, Slot>>,
    arrived: Notify,
}

impl std::fmt::Debug for QueuedApprover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedApprover")
            .field("pending", &self.lock().len())
            .finish()
    }
}

impl QueuedApprover {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of waiting requests.
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.lock().values().map(|s| s.pending.clone()).collect()
    }

    /// Wait until at least one request is parked and return one of them.
    pub async fn next_pending(&self) -> PendingApproval {
        loop {
            let arrived = self.arrived.notified();
            if let Some(p) = self.lock().values().next().map(|s| s.pending.clone()) {
                return p;
            }
            arrived.await;
        }
    }

    /// Deliver a verdict. Entries are single-use.
    pub fn resolve(&self, id: &str, approved: bool) -> ResolveResult {
        let slot = self.lock().remove(id);
        match slot {
            Some(slot) => {
                // The asker may have given up already; that is not an error here.
                let _ = slot.reply.send(approved);
                ResolveResult::Delivered
            }
            None => ResolveResult::NotFound,
        }
    }
}

/// Removes a parked request when the asking future is dropped.
struct ParkGuard<'a> {
    queue: &'a QueuedApprover,
    id: String,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        self.queue.lock().remove(&self.id);
    }
}

#[async_trait]
impl Approver for QueuedApprover {
    async fn ask(&self, request: &ApprovalRequest) -> ApprovalVerdict {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut map = self.lock();
            let mut id = generate_base62_id();
            while map.contains_key(&id) {
                id = generate_base62_id();
            }
            map.insert(
                id.clone(),
                Slot {
                    pending: PendingApproval {
                        id: id.clone(),
                        request: request.clone(),
                    },
                    reply: tx,
                },
            );
            id
        };
        let _guard = ParkGuard { queue: self, id };
        self.arrived.notify_waiters();

        match rx.await {
            Ok(true) => ApprovalVerdict::Approve,
            Ok(false) => ApprovalVerdict::Decline,
            Err(_) => ApprovalVerdict::Timeout,
        }
    }
}

/// Generate an 8-character base62 identifier.
fn generate_base62_id() -> String {
    let mut rng = rand::thread_rng();
    (0..APPROVAL_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..BASE62_CHARS.len());
            char::from(BASE62_CHARS.get(idx).copied().unwrap_or(b'0'))
        })
        .collect()
}
