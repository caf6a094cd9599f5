//! Tests for interactive approval: collaborators, deadlines, cancellation.

use std::sync::Arc;
use std::time::Duration;

use phantom_trust::cancel::CancelToken;
use phantom_trust::config::GovernorConfig;
use phantom_trust::error::ErrorKind;
use phantom_trust::governor::approval::{
    ApprovalVerdict, FixedApprover, QueuedApprover, ResolveResult,
};
use phantom_trust::governor::types::{DecidedBy, Decision, DeclineReason, Mode};
use phantom_trust::governor::EvalRequest;

use super::{governor, governor_with};

fn interactive() -> GovernorConfig {
    GovernorConfig {
        interactive: true,
        ..GovernorConfig::default()
    }
}

#[tokio::test]
async fn user_approval_is_recorded_as_user() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let gov = gov.with_approver(Arc::new(FixedApprover(ApprovalVerdict::Approve)));

    let eval = gov
        .evaluate(EvalRequest::new("socket(AF_INET)", "net"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.record.decision, Decision::Approve);
    assert_eq!(eval.record.decided_by, DecidedBy::User);
    assert!(eval.record.summary.starts_with("Approved by user: net"));
    assert_eq!(gov.stats().user_approved, 1);
}

#[tokio::test]
async fn user_decline_can_skip_the_cache() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let approver = Arc::new(FixedApprover(ApprovalVerdict::Decline));

    let eval = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(approver.clone())
                .no_cache_on_decline(),
        )
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.record.decided_by, DecidedBy::User);
    assert_eq!(eval.record.reason, Some(DeclineReason::UserDeclined));
    assert_eq!(eval.decline_kind(), Some(ErrorKind::Declined));
    assert_eq!(gov.cache_stats().len, 0);

    let again = gov
        .evaluate(EvalRequest::new("socket(AF_INET)", "net").with_approver(approver))
        .await
        .expect("evaluate should succeed");
    assert_eq!(again.record.decided_by, DecidedBy::User, "asked again");
    assert_eq!(gov.cache_stats().len, 1, "cached this time");
}

#[tokio::test]
async fn approval_deadline_becomes_auto_decline() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let queue = Arc::new(QueuedApprover::new());

    let eval = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(queue.clone())
                .with_deadline(Duration::from_millis(20)),
        )
        .await
        .expect("evaluate should succeed");

    assert_eq!(eval.record.decision, Decision::Decline);
    assert_eq!(eval.record.decided_by, DecidedBy::Auto);
    assert_eq!(eval.record.reason, Some(DeclineReason::ApprovalTimeout));
    assert_eq!(eval.record.summary, "approval timeout");
    assert_eq!(eval.decline_kind(), Some(ErrorKind::ApprovalTimeout));
    assert!(queue.pending().is_empty(), "abandoned request is unparked");
    let stats = gov.stats();
    assert_eq!(stats.auto_declined, 1);
    assert_eq!(stats.approval_timeouts, 1);
}

#[tokio::test]
async fn queued_approver_is_resolved_from_another_task() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let queue = Arc::new(QueuedApprover::new());
    let resolver = Arc::clone(&queue);

    let handle = tokio::spawn(async move {
        let pending = resolver.next_pending().await;
        assert_eq!(pending.id.len(), 8);
        assert_eq!(pending.request.name, "net");
        assert_eq!(resolver.resolve(&pending.id, true), ResolveResult::Delivered);
        assert_eq!(resolver.resolve(&pending.id, true), ResolveResult::NotFound);
    });

    let eval = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(queue)
                .with_deadline(Duration::from_secs(5)),
        )
        .await
        .expect("evaluate should succeed");
    handle.await.expect("resolver task should finish");

    assert_eq!(eval.record.decision, Decision::Approve);
    assert_eq!(eval.record.decided_by, DecidedBy::User);
}

#[tokio::test]
async fn missing_approver_declines_in_interactive_mode() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let eval = gov
        .evaluate(EvalRequest::new("socket(AF_INET)", "net"))
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.record.decision, Decision::Decline);
    assert_eq!(eval.record.decided_by, DecidedBy::Auto);
    assert_eq!(eval.record.reason, Some(DeclineReason::NoApprover));
}

#[tokio::test]
async fn request_mode_overrides_the_default() {
    let (gov, _audit, _clock) = governor();
    let eval = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_mode(Mode::Interactive)
                .with_approver(Arc::new(FixedApprover(ApprovalVerdict::Decline))),
        )
        .await
        .expect("evaluate should succeed");
    assert_eq!(eval.record.decided_by, DecidedBy::User);
    assert_eq!(gov.mode(), Mode::Automatic);
}

#[tokio::test]
async fn cancellation_while_waiting_for_approval() {
    let (gov, audit, _clock) = governor_with(interactive());
    let queue = Arc::new(QueuedApprover::new());
    let token = CancelToken::new();
    let canceller = token.clone();
    let watcher = Arc::clone(&queue);

    tokio::spawn(async move {
        watcher.next_pending().await;
        canceller.cancel();
    });

    let err = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(queue.clone())
                .with_deadline(Duration::from_secs(5))
                .with_cancel(token),
        )
        .await
        .expect_err("cancelled evaluation should fail");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(audit.is_empty());
    assert!(queue.pending().is_empty());
}

#[tokio::test]
async fn approval_granted_across_a_policy_change_is_not_cached() {
    let (gov, _audit, _clock) = governor_with(interactive());
    let gov = Arc::new(gov);
    let queue = Arc::new(QueuedApprover::new());
    let resolver = Arc::clone(&queue);
    let policy = Arc::clone(&gov);

    let handle = tokio::spawn(async move {
        let pending = resolver.next_pending().await;
        policy.set_strict(true).expect("policy change should log");
        assert_eq!(resolver.resolve(&pending.id, true), ResolveResult::Delivered);
    });

    let first = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(queue)
                .with_deadline(Duration::from_secs(5)),
        )
        .await
        .expect("evaluate should succeed");
    handle.await.expect("resolver task should finish");
    assert_eq!(first.record.decision, Decision::Approve);
    assert_eq!(first.record.decided_by, DecidedBy::User);

    let second = gov
        .evaluate(
            EvalRequest::new("socket(AF_INET)", "net")
                .with_approver(Arc::new(FixedApprover(ApprovalVerdict::Decline))),
        )
        .await
        .expect("evaluate should succeed");
    assert_ne!(second.record.decided_by, DecidedBy::Cache);
    assert_eq!(second.record.decision, Decision::Decline);
    assert!(second.record.policy_epoch > first.record.policy_epoch);
}
