//! DNAuth: nucleotide-sequence credentials with an evolution lineage.
//!
//! Users and generations live in two arenas. Each generation points at its
//! parent by index, so the lineage of a user is a walk up `parent` links from
//! the current generation. Older generations stay usable for ancestor
//! authentication at reduced privilege.
//!
//! Every mutation is appended to the audit log first and applied to the
//! arenas only after the append succeeded.

pub mod evolution;
pub mod sequence;
pub mod verifier;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Tick};
use crate::config::DnauthConfig;
use crate::crypto::{self, Digest};
use crate::entropy::EntropySource;
use crate::error::CoreError;
use crate::geology::{AuditLog, EventKind, NewEvent};

use evolution::{EvolutionEvent, EvolutionRecord};
use sequence::{MatchMode, SequenceAnalysis};
use verifier::{KdfParams, SealedSequence, SecretSequence, Verifier};

/// Privilege lost per generation back, in percent.
pub const ANCESTOR_PENALTY_PERCENT: u32 = 10;

/// Longest accepted user id.
const MAX_USER_ID_LEN: usize = 64;

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

/// Registration settings beyond the sequence itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Match mode for plain authentication.
    pub mode: MatchMode,
    /// Verifier parameters; `None` uses the configured iterations.
    pub kdf: Option<KdfParams>,
    /// Fuzzy tolerance; `None` uses the configured default.
    pub max_mutations: Option<u32>,
    /// Tick after which the key is expired.
    pub expires_at: Option<Tick>,
}

impl RegisterOptions {
    /// Options for `mode` with configured defaults.
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            kdf: None,
            max_mutations: None,
            expires_at: None,
        }
    }
}

/// Copy of a user's key record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyInfo {
    /// User id.
    pub user_id: String,
    /// Match mode.
    pub mode: MatchMode,
    /// Verifier iterations.
    pub kdf_iterations: u32,
    /// Fuzzy tolerance.
    pub max_mutations: u32,
    /// Whether the key has been revoked.
    pub revoked: bool,
    /// Reason given on revoke.
    pub revoke_reason: Option<String>,
    /// Expiry tick.
    pub expires_at: Option<Tick>,
    /// Lockout end, if a lockout was ever applied.
    pub lockout_until: Option<Tick>,
    /// Last successful authentication.
    pub last_used: Option<Tick>,
    /// Failures in the current window.
    pub fail_count: u32,
    /// Current generation id.
    pub generation: u32,
    /// Registration tick.
    pub created_at: Tick,
}

/// One generation as seen from outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationInfo {
    /// Generation id; 1 is the registered original.
    pub generation_id: u32,
    /// Hash of the verifier, never the sequence.
    pub verifier_fingerprint: Digest,
    /// Fitness score.
    pub fitness: f64,
    /// Edits from the parent generation.
    pub mutations_from_prior: usize,
    /// Creation tick.
    pub created_at: Tick,
}

/// A user's generations, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lineage {
    /// User id.
    pub user_id: String,
    /// Whether the key has been revoked.
    pub revoked: bool,
    /// Current generation id.
    pub current: u32,
    /// Generations, oldest first.
    pub generations: Vec<GenerationInfo>,
}

/// Successful authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSuccess {
    /// Generation that matched.
    pub generation_id: u32,
    /// Mode used.
    pub mode: MatchMode,
    /// Audit sequence of the success event.
    pub audit_seq: u64,
}

/// Result of a fuzzy authentication.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyMatch {
    /// Whether the candidate was accepted.
    pub ok: bool,
    /// `1 - distance / max(len)`.
    pub similarity: f64,
    /// Edit distance to the current generation.
    pub mutations: usize,
    /// Whether the candidate matched exactly.
    pub exact: bool,
    /// Audit sequence of the success event.
    pub audit_seq: u64,
}

/// Privilege granted by an ancestor match. Enforcement is up to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum Privilege {
    /// Current generation matched.
    Full,
    /// An older generation matched.
    Reduced {
        /// How many generations back the match was.
        generations_back: u32,
        /// Privilege reduction in percent.
        penalty_percent: u32,
    },
}

/// Result of an ancestor authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AncestorMatch {
    /// Whether a generation matched.
    pub ok: bool,
    /// Generation id that matched.
    pub matched_generation: u32,
    /// Depth of the match; 0 is the current generation.
    pub depth: u32,
    /// Privilege marker.
    pub privilege: Privilege,
    /// Audit sequence of the success event.
    pub audit_seq: u64,
}

/// Whether a user's key can currently back a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValidity {
    /// Registered and usable.
    Active,
    /// Revoked.
    Revoked,
    /// Past its expiry tick.
    Expired,
    /// No such user.
    Missing,
}

/// Store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DnaStats {
    /// Registered users.
    pub users: u64,
    /// Authentication attempts that reached a comparison.
    pub attempts: u64,
    /// Accepted attempts.
    pub successes: u64,
    /// Rejected attempts.
    pub failures: u64,
    /// Accepted non-exact fuzzy attempts.
    pub fuzzy_matches: u64,
    /// Accepted attempts against an older generation.
    pub ancestor_matches: u64,
    /// Lockouts applied.
    pub lockouts: u64,
    /// Evolutions and key changes.
    pub evolutions: u64,
    /// Revocations.
    pub revocations: u64,
}

// ---------------------------------------------------------------------------
// Arena records
// ---------------------------------------------------------------------------

struct Generation {
    generation_id: u32,
    parent: Option<usize>,
    verifier: Verifier,
    sealed: SealedSequence,
    fitness: f64,
    mutations_from_prior: usize,
    created_at: Tick,
}

struct UserRecord {
    id: String,
    mode: MatchMode,
    kdf: KdfParams,
    max_mutations: u32,
    revoked: Option<String>,
    expires_at: Option<Tick>,
    lockout_until: Option<Tick>,
    consecutive_lockouts: u32,
    fail_count: u32,
    window_start: Tick,
    last_used: Option<Tick>,
    created_at: Tick,
    current: usize,
    evolutions: Vec<EvolutionRecord>,
}

#[derive(Default)]
struct StoreState {
    users: Vec<UserRecord>,
    index: HashMap<String, usize>,
    generations: Vec<Generation>,
    stats: DnaStats,
}

/// A generation about to be committed.
struct Fresh {
    verifier: Verifier,
    sealed: SealedSequence,
    fitness: f64,
}

/// How a failed attempt was recorded.
enum Failure {
    Counted,
    LockedOut(Tick),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// The DNAuth credential store.
///
/// Uses a sync [`Mutex`] since the critical section is brief (no awaits).
pub struct DnaStore {
    config: DnauthConfig,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
    secret: Digest,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for DnaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("DnaStore")
            .field("users", &state.users.len())
            .field("generations", &state.generations.len())
            .finish_non_exhaustive()
    }
}

impl DnaStore {
    /// Create a store with a fresh random secret.
    pub fn new(
        config: DnauthConfig,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn EntropySource>,
    ) -> Self {
        let mut secret = [0u8; crypto::DIGEST_LEN];
        entropy.fill(&mut secret);
        Self {
            config,
            audit,
            clock,
            entropy,
            secret: Digest::from_bytes(secret),
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Use `secret` for sealing and identity keys instead of a random one.
    pub fn with_secret(mut self, secret: Digest) -> Self {
        self.secret = secret;
        self
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self, user: &str, seq: &str, kdf: KdfParams) -> Fresh {
        Fresh {
            verifier: Verifier::new(seq, kdf, self.entropy.as_ref()),
            sealed: SealedSequence::seal(
                self.secret.as_bytes(),
                user,
                seq,
                self.entropy.as_ref(),
            ),
            fitness: sequence::fitness(seq),
        }
    }

    fn candidate(&self, seq: &str) -> Result<String, CoreError> {
        sequence::validate(seq, 0, self.config.max_sequence_len)
    }

    fn new_sequence(&self, seq: &str) -> Result<String, CoreError> {
        let seq = sequence::validate(
            seq,
            self.config.min_sequence_len,
            self.config.max_sequence_len,
        )?;
        let class = sequence::complexity(&seq);
        if class < self.config.min_complexity {
            return Err(CoreError::InvalidInput(format!(
                "sequence complexity {class} is below {}",
                self.config.min_complexity
            )));
        }
        Ok(seq)
    }

    // -----------------------------------------------------------------------
    // Registration and key management
    // -----------------------------------------------------------------------

    /// Register `user` with `seq` under `mode`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] for a bad user id, a foreign symbol, a
    ///   short sequence, or one below the configured complexity.
    /// - [`CoreError::UserExists`] if the id is taken.
    /// - [`CoreError::AuditFailure`] if the registration could not be logged.
    pub fn register(
        &self,
        user: &str,
        seq: &str,
        mode: MatchMode,
        kdf: KdfParams,
    ) -> Result<u64, CoreError> {
        self.register_with_options(
            user,
            seq,
            RegisterOptions {
                kdf: Some(kdf),
                ..RegisterOptions::new(mode)
            },
        )
    }

    /// Register with explicit options.
    ///
    /// # Errors
    ///
    /// As [`register`](Self::register).
    pub fn register_with_options(
        &self,
        user: &str,
        seq: &str,
        options: RegisterOptions,
    ) -> Result<u64, CoreError> {
        validate_user_id(user)?;
        let seq = self.new_sequence(seq)?;
        let kdf = options.kdf.unwrap_or(KdfParams {
            iterations: self.config.kdf_iterations,
        });
        if kdf.iterations == 0 {
            return Err(CoreError::InvalidInput("kdf iterations must be positive".to_owned()));
        }
        let max_mutations = options
            .max_mutations
            .unwrap_or(self.config.default_max_mutations);
        let fresh = self.fresh(user, &seq, kdf);

        let mut guard = self.lock();
        if guard.index.contains_key(user) {
            return Err(CoreError::UserExists(user.to_owned()));
        }
        let now = self.clock.now();
        let seq_no = self.audit.append(
            NewEvent::new(EventKind::UserRegistered, user)
                .after(fresh.verifier.fingerprint())
                .payload(json!({
                    "mode": options.mode,
                    "kdf_iterations": kdf.iterations,
                    "max_mutations": max_mutations,
                    "expires_at": options.expires_at,
                    "length": seq.len(),
                })),
        )?;

        let st = &mut *guard;
        let gen_idx = st.generations.len();
        st.generations.push(Generation {
            generation_id: 1,
            parent: None,
            verifier: fresh.verifier,
            sealed: fresh.sealed,
            fitness: fresh.fitness,
            mutations_from_prior: 0,
            created_at: now,
        });
        let user_idx = st.users.len();
        st.users.push(UserRecord {
            id: user.to_owned(),
            mode: options.mode,
            kdf,
            max_mutations,
            revoked: None,
            expires_at: options.expires_at,
            lockout_until: None,
            consecutive_lockouts: 0,
            fail_count: 0,
            window_start: now,
            last_used: None,
            created_at: now,
            current: gen_idx,
            evolutions: Vec::new(),
        });
        st.index.insert(user.to_owned(), user_idx);
        st.stats.users = st.stats.users.saturating_add(1);
        info!(user, mode = %options.mode, audit_seq = seq_no, "dnauth user registered");
        Ok(seq_no)
    }

    /// Revoke `user`'s key. The record stays visible through
    /// [`lineage`](Self::lineage).
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] for an unknown user.
    /// - [`CoreError::Revoked`] if already revoked.
    /// - [`CoreError::AuditFailure`] if the revocation could not be logged.
    pub fn revoke(&self, user: &str, reason: &str) -> Result<u64, CoreError> {
        let mut guard = self.lock();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get_mut(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        if record.revoked.is_some() {
            return Err(CoreError::revoked("user", user));
        }
        let seq_no = self.audit.append(
            NewEvent::new(EventKind::UserRevoked, user).payload(json!({ "reason": reason })),
        )?;
        record.revoked = Some(reason.to_owned());
        st.stats.revocations = st.stats.revocations.saturating_add(1);
        warn!(user, reason, audit_seq = seq_no, "dnauth key revoked");
        Ok(seq_no)
    }

    /// Evolve `user`'s key to a new generation.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`], [`CoreError::Revoked`], [`CoreError::Expired`]
    ///   for an unusable user.
    /// - [`CoreError::InvalidInput`] if no distinct successor could be found.
    /// - [`CoreError::AuditFailure`] if the evolution could not be logged.
    pub fn evolve(&self, user: &str) -> Result<EvolutionEvent, CoreError> {
        let mut guard = self.lock();
        let now = self.clock.now();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        check_usable(record, now, false)?;
        let current = st
            .generations
            .get(record.current)
            .ok_or_else(|| CoreError::not_found("generation", user))?;
        let plain = current.sealed.open(self.secret.as_bytes(), user);
        let walk = evolution::walk(
            plain.expose(),
            self.config.evolve_delta,
            self.config.min_sequence_len,
            self.config.max_sequence_len,
            self.entropy.as_ref(),
        )
        .ok_or_else(|| CoreError::InvalidInput("no distinct successor sequence".to_owned()))?;
        let fresh = self.fresh(user, &walk.sequence, record.kdf);
        let from_generation = current.generation_id;
        let to_generation = from_generation.saturating_add(1);
        let fitness_before = current.fitness;
        let parent = record.current;

        let seq_no = self.audit.append(
            NewEvent::new(EventKind::KeyEvolved, user)
                .after(fresh.verifier.fingerprint())
                .payload(json!({
                    "from_generation": from_generation,
                    "to_generation": to_generation,
                    "mutation_count": walk.mutations.len(),
                    "distance": walk.distance,
                    "fitness_before": fitness_before,
                    "fitness_after": fresh.fitness,
                })),
        )?;

        let event = EvolutionEvent {
            user: user.to_owned(),
            from_generation,
            to_generation,
            mutation_count: walk.mutations.len(),
            fitness_before,
            fitness_after: fresh.fitness,
            distance: walk.distance,
            mutations: walk.mutations,
            sequence: SecretSequence::new(walk.sequence),
            tick: now,
        };
        let gen_idx = st.generations.len();
        st.generations.push(Generation {
            generation_id: to_generation,
            parent: Some(parent),
            verifier: fresh.verifier,
            sealed: fresh.sealed,
            fitness: fresh.fitness,
            mutations_from_prior: event.mutation_count,
            created_at: now,
        });
        if let Some(record) = st.users.get_mut(idx) {
            record.current = gen_idx;
            record.evolutions.push(EvolutionRecord::from(&event));
        }
        st.stats.evolutions = st.stats.evolutions.saturating_add(1);
        info!(
            user,
            from_generation,
            to_generation,
            mutations = event.mutation_count,
            audit_seq = seq_no,
            "dnauth key evolved"
        );
        Ok(event)
    }

    /// Replace `user`'s key after proving the current one. Starts a new
    /// generation whose parent is the current one.
    ///
    /// # Errors
    ///
    /// - [`CoreError::BadCredential`] if `old` does not match; the failure
    ///   counts toward lockout.
    /// - [`CoreError::InvalidInput`] if `new` is unacceptable.
    /// - The status errors of [`authenticate`](Self::authenticate).
    pub fn change_key(&self, user: &str, old: &str, new: &str) -> Result<u32, CoreError> {
        let old = self.candidate(old)?;
        let new = self.new_sequence(new)?;
        let mut guard = self.lock();
        let now = self.clock.now();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        check_usable(record, now, true)?;
        let current = st
            .generations
            .get(record.current)
            .ok_or_else(|| CoreError::not_found("generation", user))?;
        if !current.verifier.matches(&old) {
            return Err(self.fail(st, idx, now, "change_key"));
        }
        let distance = sequence::levenshtein(&old, &new);
        let fresh = self.fresh(user, &new, record.kdf);
        let to_generation = current.generation_id.saturating_add(1);
        let parent = record.current;

        let seq_no = self.audit.append(
            NewEvent::new(EventKind::KeyChanged, user)
                .after(fresh.verifier.fingerprint())
                .payload(json!({
                    "to_generation": to_generation,
                    "distance": distance,
                })),
        )?;

        let gen_idx = st.generations.len();
        st.generations.push(Generation {
            generation_id: to_generation,
            parent: Some(parent),
            verifier: fresh.verifier,
            sealed: fresh.sealed,
            fitness: fresh.fitness,
            mutations_from_prior: distance,
            created_at: now,
        });
        if let Some(record) = st.users.get_mut(idx) {
            record.current = gen_idx;
            record.fail_count = 0;
            record.consecutive_lockouts = 0;
            record.last_used = Some(now);
        }
        st.stats.evolutions = st.stats.evolutions.saturating_add(1);
        info!(user, to_generation, audit_seq = seq_no, "dnauth key changed");
        Ok(to_generation)
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Authenticate against the current generation under the user's mode.
    ///
    /// FUZZY users are matched exactly here; tolerance is only granted by
    /// [`authenticate_fuzzy`](Self::authenticate_fuzzy).
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidInput`] for a foreign symbol.
    /// - [`CoreError::NotFound`] for an unknown user (no audit event).
    /// - [`CoreError::Revoked`], [`CoreError::Expired`], [`CoreError::Locked`]
    ///   for an unusable key.
    /// - [`CoreError::BadCredential`] on mismatch.
    /// - [`CoreError::AuditFailure`] if the attempt could not be logged.
    pub fn authenticate(&self, user: &str, seq: &str) -> Result<AuthSuccess, CoreError> {
        let candidate = self.candidate(seq)?;
        let mut guard = self.lock();
        let now = self.clock.now();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        check_usable(record, now, true)?;
        let mode = record.mode;
        let current = st
            .generations
            .get(record.current)
            .ok_or_else(|| CoreError::not_found("generation", user))?;
        let generation_id = current.generation_id;
        let ok = match mode {
            MatchMode::Exact | MatchMode::Fuzzy => current.verifier.matches(&candidate),
            MatchMode::Codon => {
                let stored = current.sealed.open(self.secret.as_bytes(), user);
                sequence::codon_match(stored.expose(), &candidate)
            }
            MatchMode::Protein => {
                let stored = current.sealed.open(self.secret.as_bytes(), user);
                sequence::protein_match(stored.expose(), &candidate)
            }
        };
        if !ok {
            return Err(self.fail(st, idx, now, mode.as_str()));
        }
        let audit_seq = self.succeed(
            st,
            idx,
            now,
            json!({ "mode": mode, "generation": generation_id }),
        )?;
        Ok(AuthSuccess {
            generation_id,
            mode,
            audit_seq,
        })
    }

    /// Authenticate with an edit-distance tolerance of `max_mutations`.
    ///
    /// Only FUZZY users get a tolerance, capped at the one they registered
    /// with; every other mode is matched exactly.
    ///
    /// # Errors
    ///
    /// As [`authenticate`](Self::authenticate).
    pub fn authenticate_fuzzy(
        &self,
        user: &str,
        seq: &str,
        max_mutations: u32,
    ) -> Result<FuzzyMatch, CoreError> {
        let candidate = self.candidate(seq)?;
        let mut guard = self.lock();
        let now = self.clock.now();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        check_usable(record, now, true)?;
        let tolerance = match record.mode {
            MatchMode::Fuzzy => max_mutations.min(record.max_mutations),
            _ => 0,
        };
        let current = st
            .generations
            .get(record.current)
            .ok_or_else(|| CoreError::not_found("generation", user))?;
        let generation_id = current.generation_id;
        let stored = current.sealed.open(self.secret.as_bytes(), user);
        let distance = sequence::levenshtein(stored.expose(), &candidate);
        let similarity = sequence::similarity(distance, stored.len(), candidate.len());
        if distance > usize::try_from(tolerance).unwrap_or(0) {
            debug!(user, distance, tolerance, "fuzzy match rejected");
            return Err(self.fail(st, idx, now, "FUZZY"));
        }
        let exact = distance == 0;
        let audit_seq = self.succeed(
            st,
            idx,
            now,
            json!({
                "mode": MatchMode::Fuzzy,
                "generation": generation_id,
                "mutations": distance,
                "similarity": similarity,
            }),
        )?;
        if !exact {
            st.stats.fuzzy_matches = st.stats.fuzzy_matches.saturating_add(1);
        }
        Ok(FuzzyMatch {
            ok: true,
            similarity,
            mutations: distance,
            exact,
            audit_seq,
        })
    }

    /// Try the current generation and up to `max_generations_back` ancestors,
    /// newest first. The configured maximum depth caps the walk.
    ///
    /// # Errors
    ///
    /// As [`authenticate`](Self::authenticate).
    pub fn authenticate_ancestor(
        &self,
        user: &str,
        seq: &str,
        max_generations_back: u32,
    ) -> Result<AncestorMatch, CoreError> {
        let candidate = self.candidate(seq)?;
        let max_back = max_generations_back.min(self.config.max_ancestor_depth);
        let mut guard = self.lock();
        let now = self.clock.now();
        let idx = find(&guard, user)?;
        let st = &mut *guard;
        let record = st
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        check_usable(record, now, true)?;

        let mut cursor = Some(record.current);
        let mut depth = 0u32;
        let mut matched = None;
        while let Some(gen) = cursor.and_then(|i| st.generations.get(i)) {
            if depth > max_back {
                break;
            }
            if gen.verifier.matches(&candidate) {
                matched = Some(gen.generation_id);
                break;
            }
            cursor = gen.parent;
            depth = depth.saturating_add(1);
        }

        let Some(matched_generation) = matched else {
            return Err(self.fail(st, idx, now, "ANCESTOR"));
        };
        let privilege = if depth == 0 {
            Privilege::Full
        } else {
            Privilege::Reduced {
                generations_back: depth,
                penalty_percent: depth.saturating_mul(ANCESTOR_PENALTY_PERCENT).min(100),
            }
        };
        let audit_seq = self.succeed(
            st,
            idx,
            now,
            json!({
                "mode": "ANCESTOR",
                "generation": matched_generation,
                "depth": depth,
            }),
        )?;
        if depth > 0 {
            st.stats.ancestor_matches = st.stats.ancestor_matches.saturating_add(1);
        }
        Ok(AncestorMatch {
            ok: true,
            matched_generation,
            depth,
            privilege,
            audit_seq,
        })
    }

    fn succeed(
        &self,
        st: &mut StoreState,
        idx: usize,
        now: Tick,
        payload: serde_json::Value,
    ) -> Result<u64, CoreError> {
        let user = st
            .users
            .get(idx)
            .map(|r| r.id.clone())
            .unwrap_or_default();
        let seq_no = self
            .audit
            .append(NewEvent::new(EventKind::AuthSucceeded, user.as_str()).payload(payload))?;
        if let Some(record) = st.users.get_mut(idx) {
            record.fail_count = 0;
            record.consecutive_lockouts = 0;
            record.window_start = now;
            record.last_used = Some(now);
        }
        st.stats.attempts = st.stats.attempts.saturating_add(1);
        st.stats.successes = st.stats.successes.saturating_add(1);
        debug!(user = %user, audit_seq = seq_no, "dnauth authentication succeeded");
        Ok(seq_no)
    }

    /// Record a failed attempt and return the error to surface.
    fn fail(&self, st: &mut StoreState, idx: usize, now: Tick, mode: &str) -> CoreError {
        let Some(record) = st.users.get(idx) else {
            return CoreError::InvalidInput("user index out of range".to_owned());
        };
        let user = record.id.clone();
        let in_window = now.saturating_sub(record.window_start) <= self.config.fail_window_ms;
        let (window_start, prior) = if in_window {
            (record.window_start, record.fail_count)
        } else {
            (now, 0)
        };
        let count = prior.saturating_add(1);
        let outcome = if count >= self.config.fail_limit {
            let factor = 1u64
                .checked_shl(record.consecutive_lockouts)
                .unwrap_or(u64::MAX);
            let duration = self
                .config
                .lockout_ms
                .saturating_mul(factor)
                .min(self.config.max_lockout_ms);
            Failure::LockedOut(now.saturating_add(duration))
        } else {
            Failure::Counted
        };

        let event = match outcome {
            Failure::Counted => NewEvent::new(EventKind::AuthFailed, user.as_str())
                .payload(json!({ "mode": mode, "fail_count": count })),
            Failure::LockedOut(until) => NewEvent::new(EventKind::UserLockedOut, user.as_str())
                .payload(json!({ "mode": mode, "fail_count": count, "until": until })),
        };
        if let Err(e) = self.audit.append(event) {
            return e;
        }

        if let Some(record) = st.users.get_mut(idx) {
            record.window_start = window_start;
            match outcome {
                Failure::Counted => record.fail_count = count,
                Failure::LockedOut(until) => {
                    record.fail_count = 0;
                    record.lockout_until = Some(until);
                    record.consecutive_lockouts = record.consecutive_lockouts.saturating_add(1);
                    st.stats.lockouts = st.stats.lockouts.saturating_add(1);
                    warn!(user = %user, until, "dnauth user locked out");
                }
            }
        }
        st.stats.attempts = st.stats.attempts.saturating_add(1);
        st.stats.failures = st.stats.failures.saturating_add(1);
        CoreError::BadCredential { user }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Copy of `user`'s key record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown user.
    pub fn lookup(&self, user: &str) -> Result<KeyInfo, CoreError> {
        let guard = self.lock();
        let idx = find(&guard, user)?;
        let record = guard
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        let generation = guard
            .generations
            .get(record.current)
            .map_or(1, |g| g.generation_id);
        Ok(KeyInfo {
            user_id: record.id.clone(),
            mode: record.mode,
            kdf_iterations: record.kdf.iterations,
            max_mutations: record.max_mutations,
            revoked: record.revoked.is_some(),
            revoke_reason: record.revoked.clone(),
            expires_at: record.expires_at,
            lockout_until: record.lockout_until,
            last_used: record.last_used,
            fail_count: record.fail_count,
            generation,
            created_at: record.created_at,
        })
    }

    /// Every generation of `user`, oldest first. Revoked users stay visible.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown user.
    pub fn lineage(&self, user: &str) -> Result<Lineage, CoreError> {
        let guard = self.lock();
        let idx = find(&guard, user)?;
        let record = guard
            .users
            .get(idx)
            .ok_or_else(|| CoreError::not_found("user", user))?;
        let mut generations = Vec::new();
        let mut cursor = Some(record.current);
        while let Some(gen) = cursor.and_then(|i| guard.generations.get(i)) {
            generations.push(GenerationInfo {
                generation_id: gen.generation_id,
                verifier_fingerprint: gen.verifier.fingerprint(),
                fitness: gen.fitness,
                mutations_from_prior: gen.mutations_from_prior,
                created_at: gen.created_at,
            });
            cursor = gen.parent;
        }
        generations.reverse();
        Ok(Lineage {
            user_id: record.id.clone(),
            revoked: record.revoked.is_some(),
            current: generations.last().map_or(1, |g| g.generation_id),
            generations,
        })
    }

    /// Past evolutions of `user`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown user.
    pub fn evolution_history(&self, user: &str) -> Result<Vec<EvolutionRecord>, CoreError> {
        let guard = self.lock();
        let idx = find(&guard, user)?;
        Ok(guard
            .users
            .get(idx)
            .map(|r| r.evolutions.clone())
            .unwrap_or_default())
    }

    /// Whether `user`'s key can currently back a signature.
    pub fn validity(&self, user: &str) -> KeyValidity {
        let guard = self.lock();
        let Some(record) = guard.index.get(user).and_then(|i| guard.users.get(*i)) else {
            return KeyValidity::Missing;
        };
        if record.revoked.is_some() {
            KeyValidity::Revoked
        } else if record.expires_at.is_some_and(|t| self.clock.now() >= t) {
            KeyValidity::Expired
        } else {
            KeyValidity::Active
        }
    }

    /// MAC key bound to `user`, used to sign QRNet codes.
    ///
    /// Stable across evolution and still derivable after revocation, so old
    /// signatures remain checkable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown user.
    pub fn identity_key(&self, user: &str) -> Result<Digest, CoreError> {
        let guard = self.lock();
        find(&guard, user)?;
        Ok(crypto::derive_key(
            self.secret.as_bytes(),
            "identity",
            user.as_bytes(),
        ))
    }

    /// Composition and strength of `seq`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] for a foreign symbol.
    pub fn analyze(&self, seq: &str) -> Result<SequenceAnalysis, CoreError> {
        let seq = self.candidate(seq)?;
        Ok(sequence::analyze(&seq))
    }

    /// Counters.
    pub fn stats(&self) -> DnaStats {
        self.lock().stats
    }
}

fn find(state: &StoreState, user: &str) -> Result<usize, CoreError> {
    state
        .index
        .get(user)
        .copied()
        .ok_or_else(|| CoreError::not_found("user", user))
}

/// Status checks in precedence order: revoked, expired, locked.
fn check_usable(record: &UserRecord, now: Tick, check_lock: bool) -> Result<(), CoreError> {
    if record.revoked.is_some() {
        return Err(CoreError::revoked("user", &record.id));
    }
    if record.expires_at.is_some_and(|t| now >= t) {
        return Err(CoreError::expired("user", &record.id));
    }
    if check_lock {
        if let Some(until) = record.lockout_until.filter(|u| *u > now) {
            return Err(CoreError::Locked {
                user: record.id.clone(),
                until,
            });
        }
    }
    Ok(())
}

fn validate_user_id(user: &str) -> Result<(), CoreError> {
    let ok = !user.is_empty()
        && user.len() <= MAX_USER_ID_LEN
        && user
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'@' | b'-'));
    if ok {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("invalid user id {user:?}")))
    }
}
