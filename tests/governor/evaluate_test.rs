//! Tests for `Governor::evaluate`: decisions, audit linkage and counters.

use std::sync::Arc;
use std::time::Duration;

use phantom_trust::cancel::CancelToken;
use phantom_trust::error::ErrorKind;
use phantom_trust::geology::EventKind;
use phantom_trust::governor::approval::{ApprovalVerdict, FixedApprover, QueuedApprover};
use phantom_trust::governor::types::{
    Capability, DecidedBy, Decision, DeclineReason, Mode, ThreatLevel,
};
use phantom_trust::governor::EvalRequest;

use super::governor;

#[tokio::test]
async fn unlink_is_declined_with_hide_alternative() {
    let (gov, _audit, _clock) = governor();

    let eval = gov
        .evaluate(EvalRequest::new("unlink(\"/file\")", "test"))
        .await
        .expect("evaluate should succeed");

    assert_eq!(eval.record.decision, Decision::Decline);
    assert_eq!(eval.record.decided_by, DecidedBy::Auto);
    assert_eq!(eval.record.reason, Some(DeclineReason::Destructive));
    assert!(eval.record.caps.contains(Capability::Destructive));
    let alternatives = eval.record.alternatives.clone().unwrap_or_default();
    assert!(
        alternatives.contains("hide"),
        "alternatives should suggest hide, got {alternatives:?}"
    );
    assert_eq!(eval.decline_kind(), Some(ErrorKind::DestructiveDenied));
}

#[tokio::test]
async fn destructive_requests_never_approve_even_when_repeated() {
    let (gov, _audit, _clock) = governor();
    let texts = [
        "rm -rf /tmp/x",
        "kill(pid, 9);",
        "shred the logs",
        "ftruncate(fd, 0);",
        "while (1) { delete(node); }",
    ];
    for text in texts {
        for _ in 0..2 {
            let eval = gov
                .evaluate(EvalRequest::new(text, "destroyer"))
                .await
                .expect("evaluate should succeed");
            assert_eq!(eval.record.decision, Decision::Decline, "{text}");
            assert_eq!(eval.record.decided_by, DecidedBy::Auto, "{text}");
        }
    }
    assert_eq!(gov.stats().destructive_denied, 10);
    assert_eq!(gov.cache_stats().len, 0, "destructive decisions are never cached");
}

#[tokio::test]
async fn every_decision_has_exactly_one_audit_event() {
    let (gov, audit, _clock) = governor();
    let requests = [
        ("read_file(\"/etc/host\")", "probe"),
        ("unlink(\"/x\")", "remover"),
        ("socket(AF_INET); connect(s)", "net"),
        ("read_file(\"/etc/host\")", "probe"),
    ];
    for (text, name) in requests {
        let eval = gov
            .evaluate(EvalRequest::new(text, name))
            .await
            .expect("evaluate should succeed");
        let event = audit.get(eval.audit_seq).expect("event should exist");
        assert_eq!(event.kind, EventKind::DecisionCommitted);
        assert_eq!(event.subject, eval.record.fingerprint.to_hex());
        assert_eq!(event.after_hash, eval.record.content_hash());

        let matching = audit
            .tail(audit.len())
            .iter()
            .filter(|e| e.subject == eval.record.fingerprint.to_hex() && e.seq == eval.audit_seq)
            .count();
        assert_eq!(matching, 1);
    }
    assert!(audit.verify_chain().is_ok());
}

#[tokio::test]
async fn strict_mode_denies_critical_threats() {
    let (gov, _audit, _clock) = governor();
    gov.set_strict(true).expect("policy change should log");

    let eval = gov
        .evaluate(EvalRequest::new(
            "mprotect(buf, len, PROT_EXEC); connect(sock, addr);",
            "jit",
        ))
        .await
        .expect("evaluate should succeed");

    assert_eq!(eval.record.threat, ThreatLevel::Critical);
    assert_eq!(eval.record.decision, Decision::Decline);
    assert_eq!(eval.record.decided_by, DecidedBy::StrictDeny);
    assert!(eval.record.summary.starts_with("Declined: jit (strict mode"));
    let stats = gov.stats();
    assert_eq!(stats.auto_declined, 1);
    assert_eq!(stats.strict_denied, 1);
    assert_eq!(stats.threats_critical, 1);
}

#[tokio::test]
async fn outcome_buckets_sum_to_evaluations() {
    let (gov, _audit, _clock) = governor();
    let texts = [
        "read_file(\"a\")",
        "read_file(\"a\")",
        "unlink(\"b\")",
        "uname(&u)",
        "mprotect(p, n, PROT_EXEC); connect(s)",
    ];
    for text in texts {
        gov.evaluate(EvalRequest::new(text, "mix"))
            .await
            .expect("evaluate should succeed");
    }
    gov.set_strict(true).expect("policy change should log");
    gov.evaluate(EvalRequest::new("mprotect(p, n, PROT_EXEC); connect(s)", "mix"))
        .await
        .expect("evaluate should succeed");

    let stats = gov.stats();
    assert_eq!(stats.evaluations, 6);
    assert_eq!(stats.total_decisions(), 6);
    assert!(stats.strict_denied <= stats.auto_declined);
    assert!(stats.destructive_denied <= stats.auto_declined);
}

#[tokio::test]
async fn strict_and_timeout_counters_are_inside_auto_declined() {
    let (gov, _audit, _clock) = governor();
    gov.evaluate(EvalRequest::new("uname(&u)", "info"))
        .await
        .expect("evaluate should succeed");
    let timed_out = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_mode(Mode::Interactive)
                .with_approver(Arc::new(QueuedApprover::new()))
                .with_deadline(Duration::from_millis(10)),
        )
        .await
        .expect("evaluate should succeed");
    assert_eq!(timed_out.record.reason, Some(DeclineReason::ApprovalTimeout));
    gov.evaluate(
        EvalRequest::new("socket(AF_INET)", "net2")
            .with_mode(Mode::Interactive)
            .with_approver(Arc::new(FixedApprover(ApprovalVerdict::Approve))),
    )
    .await
    .expect("evaluate should succeed");
    gov.set_strict(true).expect("policy change should log");
    let strict = gov
        .evaluate(EvalRequest::new("mprotect(p, n, PROT_EXEC); connect(s)", "jit"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(strict.record.decided_by, DecidedBy::StrictDeny);

    let stats = gov.stats();
    assert_eq!(stats.evaluations, 4);
    assert_eq!(stats.auto_approved, 1);
    assert_eq!(stats.user_approved, 1);
    assert_eq!(stats.user_declined, 0);
    assert_eq!(stats.auto_declined, 2);
    assert_eq!(stats.strict_denied, 1);
    assert_eq!(stats.approval_timeouts, 1);
    assert_eq!(stats.total_decisions(), stats.evaluations);

    let with_sub_counters = stats
        .total_decisions()
        .saturating_add(stats.strict_denied)
        .saturating_add(stats.approval_timeouts);
    assert_eq!(with_sub_counters, 6, "sub-counters repeat declines already in auto_declined");
    assert_eq!(
        stats.auto_declined.checked_sub(stats.strict_denied.saturating_add(stats.approval_timeouts)),
        Some(0),
        "every automatic decline here was strict or a timeout"
    );
}

#[tokio::test]
async fn empty_text_is_invalid_input() {
    let (gov, audit, _clock) = governor();
    let err = gov
        .evaluate(EvalRequest::new(" \r\n\t ", "blank"))
        .await
        .expect_err("empty text should be rejected");
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(audit.is_empty(), "nothing should be logged");
    assert_eq!(gov.stats().evaluations, 0);
}

#[tokio::test]
async fn cancelled_request_commits_nothing() {
    let (gov, audit, _clock) = governor();
    let token = CancelToken::new();
    token.cancel();
    let err = gov
        .evaluate(EvalRequest::new("uname(&u)", "info").with_cancel(token))
        .await
        .expect_err("cancelled request should fail");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(audit.is_empty());
    assert_eq!(gov.stats().evaluations, 0);
}

#[tokio::test]
async fn approval_summary_names_request_and_threat() {
    let (gov, _audit, _clock) = governor();
    let eval = gov
        .evaluate(EvalRequest::new("read_file(\"/etc/host\")", "probe"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.record.decision, Decision::Approve);
    assert_eq!(eval.record.summary, "Approved: probe (threat: MEDIUM)");
    assert!(eval.record.alternatives.is_none());
}

#[tokio::test]
async fn history_is_newest_first_with_rollback_window() {
    let (gov, _audit, _clock) = super::governor_with(phantom_trust::config::GovernorConfig {
        rollback_window: 2,
        history_capacity: 4,
        ..phantom_trust::config::GovernorConfig::default()
    });
    for i in 0..6 {
        gov.evaluate(EvalRequest::new(format!("uname(&u{i})"), format!("r{i}")))
            .await
            .expect("evaluate should succeed");
    }
    let history = gov.history(0, 10);
    assert_eq!(history.len(), 4, "history is capped");
    assert_eq!(history[0].record.name, "r5");
    assert_eq!(history[3].record.name, "r2");
    assert!(history[0].record.can_rollback);
    assert!(history[1].record.can_rollback);
    assert!(!history[2].record.can_rollback, "two newer decisions closes the window");
    assert!(!history[3].record.can_rollback);
    assert_eq!(gov.history(1, 1)[0].record.name, "r4");
}
