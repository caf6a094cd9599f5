//! Tests for exact, fuzzy, codon and protein authentication and lockout.

use phantom_trust::config::DnauthConfig;
use phantom_trust::dnauth::sequence::MatchMode;
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::EventKind;

use super::{enroll, store, store_with, FAST_KDF, SEQ};

#[test]
fn fuzzy_user_accepts_a_single_substitution() {
    let (store, audit, _clock) = store();
    enroll(&store, "alice", MatchMode::Fuzzy);

    let m = store
        .authenticate_fuzzy("alice", "ATGCATGCATGA", 3)
        .expect("one edit is within tolerance");
    assert!(m.ok);
    assert_eq!(m.mutations, 1);
    assert!(m.similarity >= 0.9, "similarity was {}", m.similarity);
    assert!(!m.exact);

    let event = audit.get(m.audit_seq).expect("event should exist");
    assert_eq!(event.kind, EventKind::AuthSucceeded);
    let stats = store.stats();
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.fuzzy_matches, 1);
}

#[test]
fn fuzzy_tolerance_is_capped_at_registration() {
    let (store, _audit, _clock) = store();
    enroll(&store, "alice", MatchMode::Fuzzy);
    let err = store
        .authenticate_fuzzy("alice", "ATGCAAAAAAAA", 10)
        .expect_err("far candidate should fail despite a generous request");
    assert_eq!(err.kind(), ErrorKind::BadCredential);

    let exact = store
        .authenticate_fuzzy("alice", SEQ, 0)
        .expect("exact candidate always passes");
    assert!(exact.exact);
    assert_eq!(exact.similarity, 1.0);
}

#[test]
fn plain_authentication_of_fuzzy_user_is_exact() {
    let (store, _audit, _clock) = store();
    enroll(&store, "alice", MatchMode::Fuzzy);
    let err = store
        .authenticate("alice", "ATGCATGCATGA")
        .expect_err("plain authentication grants no tolerance");
    assert_eq!(err.kind(), ErrorKind::BadCredential);
    let ok = store.authenticate("alice", SEQ).expect("exact should pass");
    assert_eq!(ok.generation_id, 1);
    assert_eq!(ok.mode, MatchMode::Fuzzy);
}

#[test]
fn exact_users_get_no_fuzzy_tolerance() {
    let (store, _audit, _clock) = store();
    enroll(&store, "eve", MatchMode::Exact);
    let err = store
        .authenticate_fuzzy("eve", "ATGCATGCATGA", 3)
        .expect_err("exact users are matched exactly");
    assert_eq!(err.kind(), ErrorKind::BadCredential);
}

#[test]
fn codon_mode_accepts_synonymous_codons() {
    let (store, _audit, _clock) = store();
    enroll(&store, "cody", MatchMode::Codon);
    // CAT and CAC both encode histidine.
    store
        .authenticate("cody", "ATGCACGCATGC")
        .expect("synonymous codon should match");
    let err = store
        .authenticate("cody", "ATGCATGCATGA")
        .expect_err("cysteine to stop is not synonymous");
    assert_eq!(err.kind(), ErrorKind::BadCredential);
}

#[test]
fn codon_mode_allows_one_differing_triplet_in_ten() {
    let (store, _audit, _clock) = store();
    let stored = "ATGCATGCATGCATGCATGCATGCATGCAT";
    store
        .register("tess", stored, MatchMode::Codon, FAST_KDF)
        .expect("registration should succeed");

    // ATG to AAA changes methionine to lysine; CAT to CAC is synonymous.
    store
        .authenticate("tess", "AAACACGCATGCATGCATGCATGCATGCAT")
        .expect("one differing triplet out of ten is allowed");

    // A second differing triplet (CAT to AAA) exceeds the allowance.
    let err = store
        .authenticate("tess", "AAAAAAGCATGCATGCATGCATGCATGCAT")
        .expect_err("two differing triplets out of ten are not");
    assert_eq!(err.kind(), ErrorKind::BadCredential);
}

#[test]
fn protein_mode_compares_translations() {
    let (store, _audit, _clock) = store();
    enroll(&store, "pat", MatchMode::Protein);
    store
        .authenticate("pat", "ATGCACGCGTGT")
        .expect("same amino acids should match");
    assert!(store.authenticate("pat", "ATGCATGCATGA").is_err());
}

#[test]
fn fifth_failure_locks_the_user_out() {
    let (store, audit, clock) = store();
    enroll(&store, "mallory", MatchMode::Exact);

    for _ in 0..5 {
        let err = store
            .authenticate("mallory", "GGGGATGCATGC")
            .expect_err("wrong sequence should fail");
        assert_eq!(err.kind(), ErrorKind::BadCredential);
    }
    let kinds: Vec<EventKind> = audit.tail(audit.len()).iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::AuthFailed).count(),
        4
    );
    assert_eq!(
        kinds.iter().filter(|k| **k == EventKind::UserLockedOut).count(),
        1,
        "a lockout is a single event"
    );

    let locked = store
        .authenticate("mallory", SEQ)
        .expect_err("locked user should be refused");
    assert_eq!(locked.kind(), ErrorKind::Locked);
    let info = store.lookup("mallory").expect("lookup should succeed");
    assert_eq!(info.lockout_until, Some(910_000));
    assert_eq!(store.stats().lockouts, 1);

    clock.advance(900_000);
    store
        .authenticate("mallory", SEQ)
        .expect("lockout should have ended");
    assert_eq!(store.lookup("mallory").expect("lookup").fail_count, 0);
}

#[test]
fn failures_outside_the_window_start_over() {
    let (store, _audit, clock) = store_with(DnauthConfig {
        fail_window_ms: 1_000,
        ..DnauthConfig::default()
    });
    enroll(&store, "slow", MatchMode::Exact);
    for _ in 0..4 {
        assert!(store.authenticate("slow", "GGGGATGCATGC").is_err());
    }
    clock.advance(5_000);
    assert!(store.authenticate("slow", "GGGGATGCATGC").is_err());
    assert_eq!(store.lookup("slow").expect("lookup").fail_count, 1);
    assert_eq!(store.stats().lockouts, 0);
}

#[test]
fn foreign_symbols_are_invalid_input() {
    let (store, audit, _clock) = store();
    enroll(&store, "alice", MatchMode::Exact);
    let before = audit.len();
    let err = store
        .authenticate("alice", "ATGN")
        .expect_err("N is not a nucleotide here");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(audit.len(), before);
    assert_eq!(store.lookup("alice").expect("lookup").fail_count, 0);
}
