//! QRNet: signed links from destinations to content.
//!
//! A code binds a destination path, a content hash, the creator's identity
//! and the governor state version, signed with a MAC keyed on the creator's
//! DNAuth identity key. Verification re-derives the key, re-checks the MAC,
//! and compares the recorded governor version with the current one.
//!
//! Codes live in an arena indexed by `code_id - 1`; supersession links are
//! code ids, never references.
//!
//! Reads of the governor version and of DNAuth happen before this
//! registry's lock is taken.

pub mod code;
pub mod content;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{Clock, Tick};
use crate::config::QrnetConfig;
use crate::crypto::{self, hash, Digest};
use crate::dnauth::{DnaStore, KeyValidity};
use crate::entropy::EntropySource;
use crate::error::{CoreError, ErrorKind};
use crate::geology::{AuditLog, EventKind, NewEvent};
use crate::governor::PolicyVersion;

use code::{CodeState, FileClass, QrCode, TrustLevel, Verification, SALT_LEN};
use content::ContentStore;

/// Options for [`QrNet::create_code_with_options`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeOptions {
    /// Signing user; the bound local identity when `None`.
    pub creator: Option<String>,
    /// Expiry tick; the configured default expiry when `None`.
    pub expires_at: Option<Tick>,
}

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QrStats {
    /// Codes created.
    pub codes: u64,
    /// Codes currently active.
    pub active: u64,
    /// Codes revoked.
    pub revoked: u64,
    /// Codes superseded.
    pub superseded: u64,
    /// Codes expired.
    pub expired: u64,
    /// Items in the content store.
    pub content_items: u64,
    /// Verifications performed.
    pub verifications: u64,
    /// Verifications that failed.
    pub failed_verifications: u64,
}

struct NetState {
    codes: Vec<QrCode>,
    by_path: HashMap<String, Vec<u32>>,
    content: ContentStore,
    local_identity: Option<String>,
    verifications: u64,
    failed_verifications: u64,
}

/// Facts gathered outside the registry lock.
struct Outside {
    key: Option<Digest>,
    validity: KeyValidity,
    governor_version: u64,
}

/// The QRNet registry.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
pub struct QrNet {
    config: QrnetConfig,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
    dnauth: Arc<DnaStore>,
    policy: Arc<dyn PolicyVersion>,
    state: Mutex<NetState>,
}

impl std::fmt::Debug for QrNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("QrNet")
            .field("codes", &state.codes.len())
            .field("content_items", &state.content.len())
            .field("local_identity", &state.local_identity)
            .finish_non_exhaustive()
    }
}

impl QrNet {
    /// Create a registry. With `config.content_dir` set, the content store
    /// is mirrored to that directory and its existing files are loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the content directory cannot be
    /// opened.
    pub fn new(
        config: QrnetConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
        dnauth: Arc<DnaStore>,
        policy: Arc<dyn PolicyVersion>,
    ) -> Result<Self, CoreError> {
        let content = match &config.content_dir {
            Some(dir) => ContentStore::open(dir)
                .map_err(|e| CoreError::AuditFailure(format!("{}: {e}", dir.display())))?,
            None => ContentStore::in_memory(),
        };
        Ok(Self {
            state: Mutex::new(NetState {
                codes: Vec::new(),
                by_path: HashMap::new(),
                content,
                local_identity: None,
                verifications: 0,
                failed_verifications: 0,
            }),
            config,
            audit,
            clock,
            entropy,
            dnauth,
            policy,
        })
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sign codes created through [`create_code`](Self::create_code) as `user`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if `user` is not registered.
    pub fn bind_local_identity(&self, user: &str) -> Result<(), CoreError> {
        self.dnauth.lookup(user)?;
        self.lock().local_identity = Some(user.to_owned());
        info!(user, "qrnet local identity bound");
        Ok(())
    }

    fn validate_path(&self, path: &str) -> Result<(), CoreError> {
        if path.is_empty() {
            return Err(CoreError::InvalidInput("empty destination path".to_owned()));
        }
        if path.chars().count() > self.config.max_path_len {
            return Err(CoreError::InvalidInput(format!(
                "destination path longer than {}",
                self.config.max_path_len
            )));
        }
        if path.contains('|') {
            return Err(CoreError::InvalidInput(
                "destination path may not contain '|'".to_owned(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Content
    // -----------------------------------------------------------------------

    /// Store `content` and return its hash. Republishing identical bytes
    /// returns the same hash without a new event.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AuditFailure`] if the content cannot be persisted
    /// or the publication cannot be logged.
    pub fn publish_content(&self, content: &[u8], name: &str) -> Result<Digest, CoreError> {
        let digest = hash(content);
        let mut state = self.lock();
        if state.content.contains(&digest) {
            debug!(hash = %digest.short(), "content already published");
            return Ok(digest);
        }
        state
            .content
            .persist(&digest, content)
            .map_err(|e| CoreError::AuditFailure(format!("content store: {e}")))?;
        let appended = self.audit.append(
            NewEvent::new(EventKind::ContentPublished, digest.to_hex())
                .after(digest)
                .payload(json!({ "name": name, "len": content.len() })),
        );
        if let Err(e) = appended {
            state.content.discard(&digest);
            return Err(e);
        }
        state.content.record(digest, content.to_vec());
        info!(hash = %digest.short(), name, len = content.len(), "content published");
        Ok(digest)
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a code signed by the bound local identity.
    ///
    /// # Errors
    ///
    /// As [`create_code_with_options`](Self::create_code_with_options), plus
    /// [`CoreError::InvalidInput`] if no identity is bound.
    pub fn create_code(
        &self,
        destination_path: &str,
        content: &[u8],
        file_class: FileClass,
    ) -> Result<QrCode, CoreError> {
        self.create_code_with_options(
            destination_path,
            content,
            file_class,
            CodeOptions::default(),
        )
    }

    /// Create a code signed by `creator`.
    ///
    /// # Errors
    ///
    /// As [`create_code_with_options`](Self::create_code_with_options).
    pub fn create_code_as(
        &self,
        creator: &str,
        destination_path: &str,
        content: &[u8],
        file_class: FileClass,
    ) -> Result<QrCode, CoreError> {
        self.create_code_with_options(
            destination_path,
            content,
            file_class,
            CodeOptions {
                creator: Some(creator.to_owned()),
                expires_at: None,
            },
        )
    }

    /// Create a code with explicit creator and expiry.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] for a bad path or missing creator.
    /// - [`CoreError::NotFound`] for an unknown creator.
    /// - [`CoreError::DnauthInvalid`] if the creator's key is revoked or expired.
    /// - [`CoreError::AuditFailure`] if the creation could not be logged.
    pub fn create_code_with_options(
        &self,
        destination_path: &str,
        content: &[u8],
        file_class: FileClass,
        options: CodeOptions,
    ) -> Result<QrCode, CoreError> {
        self.validate_path(destination_path)?;
        let creator = match options.creator {
            Some(c) => c,
            None => self
                .lock()
                .local_identity
                .clone()
                .ok_or_else(|| CoreError::InvalidInput("no local identity bound".to_owned()))?,
        };
        let (key, governor_version) = self.signing_context(&creator)?;
        let mut salt = [0u8; SALT_LEN];
        self.entropy.fill(&mut salt);

        let mut state = self.lock();
        let now = self.clock.now();
        let expires_at = options.expires_at.or_else(|| {
            self.config
                .default_expiry_ms
                .map(|ms| now.saturating_add(ms))
        });
        let code = self.build_code(
            &state,
            &key,
            Draft {
                destination_path,
                content_hash: hash(content),
                file_class,
                creator,
                governor_version,
                salt,
                now,
                expires_at,
                predecessor: None,
            },
        )?;
        let content_new = !state.content.contains(&code.content_hash);
        if content_new {
            state
                .content
                .persist(&code.content_hash, content)
                .map_err(|e| CoreError::AuditFailure(format!("content store: {e}")))?;
        }
        let appended = self.audit.append(
            NewEvent::new(EventKind::CodeCreated, code.code_id.to_string())
                .after(hash(&code.signed_bytes()))
                .payload(json!({
                    "path": code.destination_path,
                    "content_hash": code.content_hash,
                    "file_class": code.file_class,
                    "creator": code.creator,
                    "governor_state_version": code.governor_state_version,
                    "expires_at": code.expires_at,
                    "content_new": content_new,
                })),
        );
        let seq_no = match appended {
            Ok(s) => s,
            Err(e) => {
                if content_new {
                    state.content.discard(&code.content_hash);
                }
                return Err(e);
            }
        };
        if content_new {
            state.content.record(code.content_hash, content.to_vec());
        }
        insert_code(&mut state, code.clone());
        info!(
            code_id = code.code_id,
            path = %code.destination_path,
            creator = %code.creator,
            qr_version = code.qr_version,
            audit_seq = seq_no,
            "qrnet code created"
        );
        Ok(code)
    }

    fn signing_context(&self, creator: &str) -> Result<(Digest, u64), CoreError> {
        let key = self.dnauth.identity_key(creator)?;
        match self.dnauth.validity(creator) {
            KeyValidity::Active => {}
            other => {
                return Err(CoreError::DnauthInvalid {
                    creator: creator.to_owned(),
                    detail: format!("key is {}", validity_str(other)),
                })
            }
        }
        Ok((key, self.policy.state_version()))
    }

    fn build_code(&self, state: &NetState, key: &Digest, draft: Draft<'_>) -> Result<QrCode, CoreError> {
        let code_id = state
            .codes
            .len()
            .checked_add(1)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| CoreError::InvalidInput("code id space exhausted".to_owned()))?;
        let mut code = QrCode {
            code_id,
            destination_path: draft.destination_path.to_owned(),
            content_hash: draft.content_hash,
            file_class: draft.file_class,
            creator: draft.creator,
            governor_state_version: draft.governor_version,
            salt: draft.salt,
            signature: Digest::ZERO,
            state: CodeState::Active,
            created_at: draft.now,
            expires_at: draft.expires_at,
            predecessor: draft.predecessor,
            superseded_by: None,
            revoke_reason: None,
            qr_version: 0,
            qr_payload: String::new(),
            verification_count: 0,
            last_verified: None,
        };
        code.signature = crypto::mac(key.as_bytes(), &code.signed_bytes());
        code.qr_payload = code.render_payload();
        code.qr_version = code::qr_version_for(code.file_class, code.qr_payload.len());
        Ok(code)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Copy of code `code_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] for id 0 and [`CoreError::NotFound`]
    /// for an unknown id.
    pub fn get_code(&self, code_id: u32) -> Result<QrCode, CoreError> {
        let state = self.lock();
        code_ref(&state, code_id).cloned()
    }

    /// Every code for `path`, oldest first.
    pub fn codes_for_path(&self, path: &str) -> Vec<QrCode> {
        let state = self.lock();
        state
            .by_path
            .get(path)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| code_ref(&state, *id).ok().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Counters.
    pub fn stats(&self) -> QrStats {
        let state = self.lock();
        let count = |s: CodeState| {
            u64::try_from(state.codes.iter().filter(|c| c.state == s).count()).unwrap_or(u64::MAX)
        };
        QrStats {
            codes: u64::try_from(state.codes.len()).unwrap_or(u64::MAX),
            active: count(CodeState::Active),
            revoked: count(CodeState::Revoked),
            superseded: count(CodeState::Superseded),
            expired: count(CodeState::Expired),
            content_items: u64::try_from(state.content.len()).unwrap_or(u64::MAX),
            verifications: state.verifications,
            failed_verifications: state.failed_verifications,
        }
    }

    // -----------------------------------------------------------------------
    // Verification
    // -----------------------------------------------------------------------

    fn gather(&self, code_id: u32) -> Result<Outside, CoreError> {
        let creator = self.get_code(code_id)?.creator;
        Ok(Outside {
            key: self.dnauth.identity_key(&creator).ok(),
            validity: self.dnauth.validity(&creator),
            governor_version: self.policy.state_version(),
        })
    }

    /// Run every check on code `code_id` and record the outcome.
    ///
    /// Checks run in order: revoked, expired, signature, creator key,
    /// governor version; `failure` names the first that failed. A code past
    /// its expiry transitions to EXPIRED here.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] / [`CoreError::NotFound`] for a bad id.
    /// - [`CoreError::AuditFailure`] if the outcome could not be logged.
    pub fn inspect_code(&self, code_id: u32) -> Result<Verification, CoreError> {
        let outside = self.gather(code_id)?;
        let mut state = self.lock();
        let now = self.clock.now();

        let past_expiry = code_ref(&state, code_id)?.is_past_expiry(now);
        let live = matches!(
            code_ref(&state, code_id)?.state,
            CodeState::Active | CodeState::Superseded
        );
        if past_expiry && live {
            let seq_no = self.audit.append(
                NewEvent::new(EventKind::CodeExpired, code_id.to_string())
                    .payload(json!({ "tick": now })),
            )?;
            if let Some(code) = code_mut(&mut state, code_id) {
                code.state = CodeState::Expired;
            }
            info!(code_id, audit_seq = seq_no, "qrnet code expired");
        }

        let code = code_ref(&state, code_id)?;
        let signature_valid = outside
            .key
            .is_some_and(|k| crypto::verify_mac(k.as_bytes(), &code.signed_bytes(), &code.signature));
        let dnauth_valid = outside.validity == KeyValidity::Active;
        let governor_state_valid = code.governor_state_version == outside.governor_version;

        let mut notes = Vec::new();
        let failure = match code.state {
            CodeState::Revoked => {
                notes.push(format!(
                    "code revoked: {}",
                    code.revoke_reason.as_deref().unwrap_or("no reason")
                ));
                Some(ErrorKind::Revoked)
            }
            CodeState::Expired => {
                notes.push("code expired".to_owned());
                Some(ErrorKind::Expired)
            }
            CodeState::Active | CodeState::Superseded => {
                if !signature_valid {
                    notes.push("signature mismatch".to_owned());
                    Some(ErrorKind::BadSignature)
                } else if !dnauth_valid {
                    notes.push(format!(
                        "creator {} key is {}",
                        code.creator,
                        validity_str(outside.validity)
                    ));
                    Some(ErrorKind::DnauthInvalid)
                } else if !governor_state_valid {
                    notes.push(format!(
                        "governor state stale: recorded {}, current {}",
                        code.governor_state_version, outside.governor_version
                    ));
                    Some(ErrorKind::GovStateMismatch)
                } else {
                    None
                }
            }
        };
        let mut trust = match code.state {
            CodeState::Revoked | CodeState::Expired => TrustLevel::Untrusted,
            _ => code::trust_level(signature_valid, dnauth_valid, governor_state_valid),
        };
        if let Some(next) = code.superseded_by {
            notes.push(format!("superseded by {next}"));
            trust = trust.min(TrustLevel::Low);
        }
        if notes.is_empty() {
            notes.push("all checks passed".to_owned());
        }
        let details = notes.join("; ");
        let ok = failure.is_none();
        let code_state = code.state;

        let kind = if ok {
            EventKind::CodeVerified
        } else {
            EventKind::CodeVerifyFailed
        };
        let audit_seq = self.audit.append(
            NewEvent::new(kind, code_id.to_string()).payload(json!({
                "signature_valid": signature_valid,
                "governor_state_valid": governor_state_valid,
                "dnauth_valid": dnauth_valid,
                "trust_level": trust,
                "failure": failure,
            })),
        )?;

        if let Some(code) = code_mut(&mut state, code_id) {
            code.verification_count = code.verification_count.saturating_add(1);
            code.last_verified = Some(now);
        }
        state.verifications = state.verifications.saturating_add(1);
        if !ok {
            state.failed_verifications = state.failed_verifications.saturating_add(1);
            warn!(code_id, failure = ?failure, %details, "qrnet verification failed");
        } else {
            debug!(code_id, trust = %trust, "qrnet code verified");
        }
        Ok(Verification {
            code_id,
            ok,
            failure,
            signature_valid,
            governor_state_valid,
            dnauth_valid,
            trust_level: trust,
            state: code_state,
            details,
            audit_seq,
        })
    }

    /// Verify code `code_id`, turning the first failed check into an error.
    ///
    /// # Errors
    ///
    /// The errors of [`inspect_code`](Self::inspect_code), plus
    /// [`CoreError::Revoked`], [`CoreError::Expired`],
    /// [`CoreError::BadSignature`], [`CoreError::DnauthInvalid`] or
    /// [`CoreError::GovStateMismatch`] for a failed check.
    pub fn verify_code(&self, code_id: u32) -> Result<Verification, CoreError> {
        let v = self.inspect_code(code_id)?;
        let Some(kind) = v.failure else {
            return Ok(v);
        };
        let code = self.get_code(code_id)?;
        Err(match kind {
            ErrorKind::Revoked => CoreError::revoked("code", code_id),
            ErrorKind::Expired => CoreError::expired("code", code_id),
            ErrorKind::BadSignature => CoreError::BadSignature { code_id },
            ErrorKind::DnauthInvalid => CoreError::DnauthInvalid {
                creator: code.creator,
                detail: v.details,
            },
            ErrorKind::GovStateMismatch => CoreError::GovStateMismatch {
                code_id,
                recorded: code.governor_state_version,
                current: self.policy.state_version(),
            },
            _ => CoreError::InvalidInput(v.details),
        })
    }

    /// Verify the code a compact payload refers to, after checking that the
    /// payload's claims match the stored record.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidInput`] for a malformed payload,
    /// [`CoreError::BadSignature`] if its claims differ from the record, and
    /// the errors of [`verify_code`](Self::verify_code).
    pub fn verify_payload(&self, payload: &str) -> Result<Verification, CoreError> {
        let fields = code::parse_payload(payload)?;
        let code = self.get_code(fields.code_id)?;
        let claims_match = fields.destination_path == code.destination_path
            && fields.content_hash == code.content_hash
            && fields.creator == code.creator
            && fields.governor_state_version == code.governor_state_version
            && crypto::ct_eq(&fields.signature, &code.signature)
            && fields.created_at == code.created_at;
        if !claims_match {
            warn!(code_id = code.code_id, "payload claims differ from record");
            return Err(CoreError::BadSignature {
                code_id: code.code_id,
            });
        }
        self.verify_code(fields.code_id)
    }

    /// Verify code `code_id` and that `content` is what it links to.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidInput`] if the content hash differs, and the
    /// errors of [`verify_code`](Self::verify_code).
    pub fn verify_content(&self, code_id: u32, content: &[u8]) -> Result<Verification, CoreError> {
        let code = self.get_code(code_id)?;
        let actual = hash(content);
        if actual != code.content_hash {
            return Err(CoreError::InvalidInput(format!(
                "content hash mismatch for code {code_id}: expected {}, got {}",
                code.content_hash.short(),
                actual.short()
            )));
        }
        self.verify_code(code_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Revoke code `code_id`. The record is kept.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] / [`CoreError::NotFound`] for a bad id.
    /// - [`CoreError::Revoked`] if already revoked.
    /// - [`CoreError::AuditFailure`] if the revocation could not be logged.
    pub fn revoke_code(&self, code_id: u32, reason: &str) -> Result<u64, CoreError> {
        let mut state = self.lock();
        if code_ref(&state, code_id)?.state == CodeState::Revoked {
            return Err(CoreError::revoked("code", code_id));
        }
        let seq_no = self.audit.append(
            NewEvent::new(EventKind::CodeRevoked, code_id.to_string())
                .payload(json!({ "reason": reason })),
        )?;
        if let Some(code) = code_mut(&mut state, code_id) {
            code.state = CodeState::Revoked;
            code.revoke_reason = Some(reason.to_owned());
        }
        warn!(code_id, reason, audit_seq = seq_no, "qrnet code revoked");
        Ok(seq_no)
    }

    /// Replace active code `old_id` with a new code for the same destination,
    /// class and creator, linking to `new_content`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Revoked`] / [`CoreError::Expired`] if the old code is
    ///   unusable, [`CoreError::InvalidInput`] if it was already superseded.
    /// - [`CoreError::DnauthInvalid`] if the creator's key is no longer valid.
    /// - [`CoreError::AuditFailure`] if the supersession could not be logged.
    pub fn supersede_code(&self, old_id: u32, new_content: &[u8]) -> Result<QrCode, CoreError> {
        let old = self.get_code(old_id)?;
        let (key, governor_version) = self.signing_context(&old.creator)?;
        let mut salt = [0u8; SALT_LEN];
        self.entropy.fill(&mut salt);

        let mut state = self.lock();
        let now = self.clock.now();
        let old = code_ref(&state, old_id)?.clone();
        match old.state {
            CodeState::Active if !old.is_past_expiry(now) => {}
            CodeState::Active | CodeState::Expired => return Err(CoreError::expired("code", old_id)),
            CodeState::Revoked => return Err(CoreError::revoked("code", old_id)),
            CodeState::Superseded => {
                return Err(CoreError::InvalidInput(format!(
                    "code {old_id} was already superseded"
                )))
            }
        }
        let code = self.build_code(
            &state,
            &key,
            Draft {
                destination_path: &old.destination_path,
                content_hash: hash(new_content),
                file_class: old.file_class,
                creator: old.creator.clone(),
                governor_version,
                salt,
                now,
                expires_at: old
                    .expires_at
                    .map(|t| t.saturating_sub(old.created_at).saturating_add(now)),
                predecessor: Some(old_id),
            },
        )?;
        let content_new = !state.content.contains(&code.content_hash);
        if content_new {
            state
                .content
                .persist(&code.content_hash, new_content)
                .map_err(|e| CoreError::AuditFailure(format!("content store: {e}")))?;
        }
        let appended = self.audit.append(
            NewEvent::new(EventKind::CodeSuperseded, old_id.to_string())
                .after(hash(&code.signed_bytes()))
                .payload(json!({
                    "old_code_id": old_id,
                    "new_code_id": code.code_id,
                    "content_hash": code.content_hash,
                    "governor_state_version": code.governor_state_version,
                    "content_new": content_new,
                })),
        );
        let seq_no = match appended {
            Ok(s) => s,
            Err(e) => {
                if content_new {
                    state.content.discard(&code.content_hash);
                }
                return Err(e);
            }
        };
        if content_new {
            state.content.record(code.content_hash, new_content.to_vec());
        }
        if let Some(prev) = code_mut(&mut state, old_id) {
            prev.state = CodeState::Superseded;
            prev.superseded_by = Some(code.code_id);
        }
        insert_code(&mut state, code.clone());
        info!(
            old_code_id = old_id,
            new_code_id = code.code_id,
            audit_seq = seq_no,
            "qrnet code superseded"
        );
        Ok(code)
    }

    // -----------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------

    /// Bytes code `code_id` links to, or `None` if the store does not hold them.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] / [`CoreError::NotFound`] for a bad id.
    /// - [`CoreError::Revoked`] for a revoked code.
    pub fn fetch_for_code(&self, code_id: u32) -> Result<Option<Vec<u8>>, CoreError> {
        let state = self.lock();
        let code = code_ref(&state, code_id)?;
        if code.state == CodeState::Revoked {
            return Err(CoreError::revoked("code", code_id));
        }
        Ok(state
            .content
            .get(&code.content_hash)
            .filter(|bytes| hash(bytes) == code.content_hash)
            .map(<[u8]>::to_vec))
    }

    /// [`fetch_for_code`](Self::fetch_for_code) for async callers that may
    /// give up; nothing is read once `cancel` has fired.
    ///
    /// # Errors
    ///
    /// [`CoreError::Cancelled`] if the token fired, otherwise as
    /// [`fetch_for_code`](Self::fetch_for_code).
    pub async fn fetch_for_code_cancellable(
        &self,
        code_id: u32,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        self.fetch_for_code(code_id)
    }
}

/// Inputs for a new code.
struct Draft<'a> {
    destination_path: &'a str,
    content_hash: Digest,
    file_class: FileClass,
    creator: String,
    governor_version: u64,
    salt: [u8; SALT_LEN],
    now: Tick,
    expires_at: Option<Tick>,
    predecessor: Option<u32>,
}

fn slot(code_id: u32) -> Result<usize, CoreError> {
    if code_id == 0 {
        return Err(CoreError::InvalidInput("code id 0 is out of range".to_owned()));
    }
    usize::try_from(code_id.saturating_sub(1))
        .map_err(|_| CoreError::InvalidInput(format!("code id {code_id} is out of range")))
}

fn code_ref(state: &NetState, code_id: u32) -> Result<&QrCode, CoreError> {
    state
        .codes
        .get(slot(code_id)?)
        .ok_or_else(|| CoreError::not_found("code", code_id))
}

fn code_mut(state: &mut NetState, code_id: u32) -> Option<&mut QrCode> {
    slot(code_id).ok().and_then(|i| state.codes.get_mut(i))
}

fn insert_code(state: &mut NetState, code: QrCode) {
    state
        .by_path
        .entry(code.destination_path.clone())
        .or_default()
        .push(code.code_id);
    state.codes.push(code);
}

fn validity_str(v: KeyValidity) -> &'static str {
    match v {
        KeyValidity::Active => "active",
        KeyValidity::Revoked => "revoked",
        KeyValidity::Expired => "expired",
        KeyValidity::Missing => "missing",
    }
}
