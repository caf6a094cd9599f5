//! Tests for decision caching through the governor.

use phantom_trust::geology::EventKind;
use phantom_trust::governor::types::{DecidedBy, Decision};
use phantom_trust::governor::EvalRequest;

use super::governor;

const PROBE: &str = "read_file(\"/etc/host\")";

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let (gov, _audit, _clock) = governor();

    let first = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("first evaluate should succeed");
    assert!(matches!(
        first.record.decided_by,
        DecidedBy::Auto | DecidedBy::User
    ));

    let second = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("second evaluate should succeed");
    assert_eq!(second.record.decided_by, DecidedBy::Cache);
    assert_eq!(second.record.decision, first.record.decision);
    assert_eq!(second.record.caps, first.record.caps);
    assert_eq!(second.record.threat, first.record.threat);

    let stats = gov.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    let cache = gov.cache_stats();
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 1);
}

#[tokio::test]
async fn whitespace_variants_share_a_fingerprint() {
    let (gov, _audit, _clock) = governor();
    gov.evaluate(EvalRequest::new("uname(&u);   \r\n", "info"))
        .await
        .expect("evaluate should succeed");
    let again = gov
        .evaluate(EvalRequest::new("\n uname(&u);", "info"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(again.record.decided_by, DecidedBy::Cache);

    let renamed = gov
        .evaluate(EvalRequest::new("uname(&u);", "other"))
        .await
        .expect("evaluate should succeed");
    assert_ne!(renamed.record.decided_by, DecidedBy::Cache, "name is part of the fingerprint");
}

#[tokio::test]
async fn policy_change_invalidates_cached_decisions() {
    let (gov, _audit, _clock) = governor();
    gov.evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("evaluate should succeed");

    gov.set_strict(true).expect("policy change should log");
    let after_strict = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("evaluate should succeed");
    assert_ne!(after_strict.record.decided_by, DecidedBy::Cache);

    let cached_again = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(cached_again.record.decided_by, DecidedBy::Cache);
}

#[tokio::test]
async fn disabled_cache_never_hits() {
    let (gov, _audit, _clock) = governor();
    gov.enable_cache(false).expect("policy change should log");
    for _ in 0..3 {
        let eval = gov
            .evaluate(EvalRequest::new(PROBE, "probe"))
            .await
            .expect("evaluate should succeed");
        assert_eq!(eval.record.decided_by, DecidedBy::Auto);
    }
    assert_eq!(gov.stats().cache_hits, 0);
    assert!(!gov.is_cache_enabled());
}

#[tokio::test]
async fn clear_and_invalidate_are_audited() {
    let (gov, audit, _clock) = governor();
    let eval = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("evaluate should succeed");
    let fp = eval.record.fingerprint;

    let seq = gov
        .invalidate(&fp)
        .expect("invalidate should log")
        .expect("entry should have existed");
    assert_eq!(
        audit.get(seq).map(|e| e.kind),
        Some(EventKind::CacheInvalidated)
    );
    assert_eq!(gov.invalidate(&fp).expect("invalidate should succeed"), None);

    let fresh = gov
        .evaluate(EvalRequest::new(PROBE, "probe"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(fresh.record.decision, Decision::Approve);
    assert_ne!(fresh.record.decided_by, DecidedBy::Cache);

    let cleared = gov.clear_cache().expect("clear should log");
    assert_eq!(
        audit.get(cleared).map(|e| e.kind),
        Some(EventKind::CacheCleared)
    );
    assert_eq!(gov.cache_stats().len, 0);
}

#[tokio::test]
async fn consecutive_decisions_link_prior_fingerprint() {
    let (gov, _audit, _clock) = governor();
    let a = gov
        .evaluate(EvalRequest::new("uname(&a)", "a"))
        .await
        .expect("evaluate should succeed");
    let b = gov
        .evaluate(EvalRequest::new("uname(&b)", "b"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(a.record.prior_fingerprint, None);
    assert_eq!(b.record.prior_fingerprint, Some(a.record.fingerprint));
}
