//! Tests for registration, revocation and key records.

use phantom_trust::dnauth::sequence::{Complexity, MatchMode};
use phantom_trust::dnauth::{KeyValidity, RegisterOptions};
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::EventKind;

use super::{enroll, store, FAST_KDF, SEQ};

#[test]
fn registration_is_logged_and_visible() {
    let (store, audit, _clock) = store();
    let seq = store
        .register("alice", SEQ, MatchMode::Fuzzy, FAST_KDF)
        .expect("registration should succeed");

    let event = audit.get(seq).expect("event should exist");
    assert_eq!(event.kind, EventKind::UserRegistered);
    assert_eq!(event.subject, "alice");
    let payload = event.payload_json().expect("payload should be JSON");
    assert_eq!(payload["mode"], "FUZZY");
    assert!(
        !String::from_utf8_lossy(&event.payload).contains(SEQ),
        "the sequence never reaches the log"
    );

    let info = store.lookup("alice").expect("lookup should succeed");
    assert_eq!(info.mode, MatchMode::Fuzzy);
    assert_eq!(info.kdf_iterations, 16);
    assert_eq!(info.max_mutations, 3);
    assert_eq!(info.generation, 1);
    assert!(!info.revoked);
    assert_eq!(store.validity("alice"), KeyValidity::Active);
    assert_eq!(store.stats().users, 1);
}

#[test]
fn registration_normalizes_case_and_whitespace() {
    let (store, _audit, _clock) = store();
    store
        .register("carol", "atgc atgc\natgc", MatchMode::Exact, FAST_KDF)
        .expect("registration should succeed");
    store
        .authenticate("carol", SEQ)
        .expect("normalized sequence should match");
}

#[test]
fn bad_registrations_are_rejected_without_events() {
    let (store, audit, _clock) = store();
    let cases = [
        ("dave", "ATGC", "too short"),
        ("dave", "ATGCATGCATGX", "foreign symbol"),
        ("dave", "AAAAAAAAAAAA", "low complexity"),
        ("", SEQ, "empty user id"),
        ("bad user", SEQ, "space in user id"),
    ];
    for (user, seq, why) in cases {
        let err = store
            .register(user, seq, MatchMode::Exact, FAST_KDF)
            .expect_err(why);
        assert_eq!(err.kind(), ErrorKind::InvalidInput, "{why}");
    }
    assert!(audit.is_empty());

    enroll(&store, "dave", MatchMode::Exact);
    let dup = store
        .register("dave", SEQ, MatchMode::Exact, FAST_KDF)
        .expect_err("duplicate should be rejected");
    assert_eq!(dup.kind(), ErrorKind::UserExists);
    assert_eq!(audit.len(), 1);
}

#[test]
fn revoked_key_stays_in_lineage() {
    let (store, audit, _clock) = store();
    enroll(&store, "erin", MatchMode::Exact);

    let seq = store.revoke("erin", "lost device").expect("revoke should log");
    assert_eq!(
        audit.get(seq).map(|e| e.kind),
        Some(EventKind::UserRevoked)
    );
    assert_eq!(store.validity("erin"), KeyValidity::Revoked);

    let lineage = store.lineage("erin").expect("lineage should survive revocation");
    assert!(lineage.revoked);
    assert_eq!(lineage.generations.len(), 1);

    let err = store
        .authenticate("erin", SEQ)
        .expect_err("revoked key should not authenticate");
    assert_eq!(err.kind(), ErrorKind::Revoked);
    let again = store.revoke("erin", "twice").expect_err("double revoke");
    assert_eq!(again.kind(), ErrorKind::Revoked);
    assert!(store.identity_key("erin").is_ok(), "old signatures stay checkable");
}

#[test]
fn expiry_is_enforced_on_authentication() {
    let (store, _audit, clock) = store();
    store
        .register_with_options(
            "frank",
            SEQ,
            RegisterOptions {
                kdf: Some(FAST_KDF),
                expires_at: Some(20_000),
                ..RegisterOptions::new(MatchMode::Exact)
            },
        )
        .expect("registration should succeed");
    store.authenticate("frank", SEQ).expect("not yet expired");

    clock.advance(10_000);
    assert_eq!(store.validity("frank"), KeyValidity::Expired);
    let err = store
        .authenticate("frank", SEQ)
        .expect_err("expired key should not authenticate");
    assert_eq!(err.kind(), ErrorKind::Expired);
}

#[test]
fn unknown_users_are_not_found() {
    let (store, audit, _clock) = store();
    assert_eq!(
        store.authenticate("ghost", SEQ).map_err(|e| e.kind()),
        Err(ErrorKind::NotFound)
    );
    assert_eq!(store.lookup("ghost").map_err(|e| e.kind()).err(), Some(ErrorKind::NotFound));
    assert_eq!(store.validity("ghost"), KeyValidity::Missing);
    assert!(audit.is_empty(), "unknown users leave no trace");
}

#[test]
fn analyze_reports_strength() {
    let (store, _audit, _clock) = store();
    let strong = store.analyze(SEQ).expect("analysis should succeed");
    assert_eq!(strong.length, 12);
    assert_eq!(strong.complexity, Complexity::Genomic);
    assert!(strong.warnings.is_empty());

    let weak = store.analyze("AAAAAAAAAAAA").expect("analysis should succeed");
    assert_eq!(weak.complexity, Complexity::Low);
    assert!(weak.has_repeats);
    assert!(weak.warnings.iter().any(|w| w.contains("repeats")));

    assert!(store.analyze("ATGU").is_err());
}
