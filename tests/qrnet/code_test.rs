//! Tests for code creation, verification and payloads.

use phantom_trust::cancel::CancelToken;
use phantom_trust::crypto::hash;
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::EventKind;
use phantom_trust::qrnet::code::{FileClass, TrustLevel, PAYLOAD_PREFIX};

use super::core;

#[test]
fn fresh_code_verifies_with_high_trust() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::User)
        .expect("create should succeed");
    assert_eq!(code.code_id, 1);
    assert_eq!(code.creator, "alice");
    assert_eq!(code.content_hash, hash(b"hello"));
    assert_eq!(code.governor_state_version, core.governor().state_version());
    assert!(code.qr_payload.starts_with(PAYLOAD_PREFIX));
    assert!(code.qr_version >= FileClass::User.min_version());

    let v = core.qrnet().verify_code(code.code_id).expect("code should verify");
    assert!(v.ok);
    assert!(v.signature_valid && v.dnauth_valid && v.governor_state_valid);
    assert_eq!(v.trust_level, TrustLevel::High);
    assert_eq!(v.details, "all checks passed");
    assert_eq!(
        core.audit().get(v.audit_seq).map(|e| e.kind),
        Some(EventKind::CodeVerified)
    );
    let stored = core.qrnet().get_code(code.code_id).expect("code should exist");
    assert_eq!(stored.verification_count, 1);
    assert_eq!(stored.last_verified, Some(50_000));
}

#[test]
fn revoking_the_creator_invalidates_their_codes() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::User)
        .expect("create should succeed");
    core.revoke_dnauth("alice", "left the team")
        .expect("revoke should succeed");

    let err = core
        .qrnet()
        .verify_code(code.code_id)
        .expect_err("code of a revoked creator should fail");
    assert_eq!(err.kind(), ErrorKind::DnauthInvalid);

    let v = core.qrnet().inspect_code(code.code_id).expect("inspect should succeed");
    assert!(v.signature_valid, "the signature itself still holds");
    assert!(!v.dnauth_valid);
    assert_eq!(v.trust_level, TrustLevel::Low);
    assert_eq!(v.failure, Some(ErrorKind::DnauthInvalid));

    let create = core
        .qrnet()
        .create_code("/geo/data/y", b"more", FileClass::User)
        .expect_err("revoked creators cannot sign");
    assert_eq!(create.kind(), ErrorKind::DnauthInvalid);
}

#[test]
fn policy_change_makes_codes_stale() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::System)
        .expect("create should succeed");
    core.governor().set_strict(true).expect("policy change should log");

    let err = core
        .qrnet()
        .verify_code(code.code_id)
        .expect_err("stale governor version should fail");
    assert_eq!(err.kind(), ErrorKind::GovStateMismatch);

    let v = core.qrnet().inspect_code(code.code_id).expect("inspect should succeed");
    assert!(v.signature_valid);
    assert!(!v.governor_state_valid);
    assert_eq!(v.trust_level, TrustLevel::Medium);
    assert!(v.details.contains("governor state stale"));
    assert_eq!(core.qrnet().stats().failed_verifications, 2);
}

#[test]
fn published_content_round_trips_through_a_code() {
    let (core, _clock) = core();
    let digest = core
        .qrnet()
        .publish_content(b"payload bytes", "blob")
        .expect("publish should succeed");
    let events = core.audit().len();
    assert_eq!(
        core.qrnet().publish_content(b"payload bytes", "again").expect("republish"),
        digest
    );
    assert_eq!(core.audit().len(), events, "republishing logs nothing");

    let code = core
        .qrnet()
        .create_code("/geo/blob", b"payload bytes", FileClass::User)
        .expect("create should succeed");
    assert_eq!(code.content_hash, digest);
    let fetched = core
        .qrnet()
        .fetch_for_code(code.code_id)
        .expect("fetch should succeed")
        .expect("content should be stored");
    assert_eq!(hash(&fetched), code.content_hash);
    assert_eq!(core.qrnet().stats().content_items, 1);
}

#[tokio::test]
async fn cancelled_fetch_reads_nothing() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::User)
        .expect("create should succeed");

    let live = CancelToken::new();
    let bytes = core
        .qrnet()
        .fetch_for_code_cancellable(code.code_id, &live)
        .await
        .expect("fetch should succeed");
    assert_eq!(bytes.as_deref(), Some(&b"hello"[..]));

    let fired = CancelToken::new();
    fired.cancel();
    let err = core
        .qrnet()
        .fetch_for_code_cancellable(code.code_id, &fired)
        .await
        .expect_err("cancelled fetch should fail");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[test]
fn payload_claims_are_checked_against_the_record() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::User)
        .expect("create should succeed");

    let v = core
        .qrnet()
        .verify_payload(&code.qr_payload)
        .expect("genuine payload should verify");
    assert_eq!(v.code_id, code.code_id);

    let forged = code.qr_payload.replace("/geo/data/x", "/geo/data/z");
    let err = core
        .qrnet()
        .verify_payload(&forged)
        .expect_err("forged path should fail");
    assert_eq!(err.kind(), ErrorKind::BadSignature);

    let garbage = core
        .qrnet()
        .verify_payload("XR:1|/a")
        .expect_err("missing prefix should fail");
    assert_eq!(garbage.kind(), ErrorKind::InvalidInput);
}

#[test]
fn verify_content_rejects_other_bytes() {
    let (core, _clock) = core();
    let code = core
        .qrnet()
        .create_code("/geo/data/x", b"hello", FileClass::User)
        .expect("create should succeed");
    core.qrnet()
        .verify_content(code.code_id, b"hello")
        .expect("matching content should verify");
    let err = core
        .qrnet()
        .verify_content(code.code_id, b"HELLO")
        .expect_err("other bytes should fail");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[test]
fn bad_inputs_are_rejected() {
    let (core, _clock) = core();
    let qr = core.qrnet();
    let long = "p".repeat(513);
    for path in ["", "a|b", long.as_str()] {
        let err = qr
            .create_code(path, b"x", FileClass::User)
            .expect_err("bad path should fail");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
    let err = qr
        .create_code_as("nobody", "/p", b"x", FileClass::User)
        .expect_err("unknown creator should fail");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(qr.get_code(0).map_err(|e| e.kind()).err(), Some(ErrorKind::InvalidInput));
    assert_eq!(qr.get_code(9).map_err(|e| e.kind()).err(), Some(ErrorKind::NotFound));
    assert_eq!(qr.stats().codes, 0);
}

#[test]
fn unbound_registry_needs_an_explicit_creator() {
    let (core, _clock) = super::core_with(phantom_trust::config::Config::default());
    let err = core
        .qrnet()
        .create_code("/p", b"x", FileClass::User)
        .expect_err("no identity is bound");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(
        core.qrnet().bind_local_identity("nobody").map_err(|e| e.kind()),
        Err(ErrorKind::NotFound)
    );
}

#[test]
fn higher_classes_render_larger_codes() {
    let (core, _clock) = core();
    let user = core
        .qrnet()
        .create_code("/a", b"x", FileClass::User)
        .expect("create should succeed");
    let critical = core
        .qrnet()
        .create_code("/b", b"x", FileClass::Critical)
        .expect("create should succeed");
    assert!(critical.qr_version > user.qr_version);
    assert_eq!(critical.qr_version, 40);
    assert_eq!(critical.code_id, 2);
}
