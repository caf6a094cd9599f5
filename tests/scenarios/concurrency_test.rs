//! Governor, DNAuth and QRNet driven from many tasks at once.

use std::collections::BTreeSet;
use std::sync::Arc;

use phantom_trust::dnauth::sequence::MatchMode;
use phantom_trust::dnauth::verifier::KdfParams;
use phantom_trust::error::CoreError;
use phantom_trust::geology::EventKind;
use phantom_trust::governor::types::{DecidedBy, Decision};
use phantom_trust::governor::EvalRequest;
use phantom_trust::qrnet::code::FileClass;
use tokio::task::JoinSet;

use super::core;

const SEQ: &str = "ATGCATGCATGC";
const KDF: KdfParams = KdfParams { iterations: 16 };
const ROUNDS: usize = 16;
const CRITICAL: &str = "mprotect(p, n, PROT_EXEC); connect(s, a);";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_share_one_dense_chain() {
    let core = Arc::new(core());
    core.dnauth()
        .register("alice", SEQ, MatchMode::Exact, KDF)
        .expect("alice should register");
    let before = core.audit().len();

    let mut tasks: JoinSet<Result<Option<u64>, CoreError>> = JoinSet::new();
    for i in 0..ROUNDS {
        let c = Arc::clone(&core);
        tasks.spawn(async move {
            let request = EvalRequest::new(format!("read_file(\"/data/{i}\")"), "reader");
            c.governor()
                .evaluate(request)
                .await
                .map(|eval| Some(eval.audit_seq))
        });
        let c = Arc::clone(&core);
        tasks.spawn(async move {
            c.dnauth()
                .authenticate("alice", SEQ)
                .map(|ok| Some(ok.audit_seq))
        });
        let c = Arc::clone(&core);
        tasks.spawn(async move {
            let path = format!("/race/{i}.txt");
            let body = format!("body {i}");
            c.qrnet()
                .create_code_as("alice", &path, body.as_bytes(), FileClass::User)
                .map(|_| None)
        });
    }

    let mut returned = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .expect("task should not panic")
            .expect("operation should succeed");
        returned.extend(outcome);
    }

    let audit = core.audit();
    let events = audit.read_range(0, u64::MAX);
    assert_eq!(events.len(), audit.len());
    assert_eq!(events.len(), before.saturating_add(ROUNDS.saturating_mul(3)));
    for (position, event) in events.iter().enumerate() {
        let expected = u64::try_from(position).expect("position should fit");
        assert_eq!(event.seq, expected);
    }

    let unique: BTreeSet<u64> = returned.iter().copied().collect();
    assert_eq!(unique.len(), returned.len());
    assert_eq!(returned.len(), ROUNDS.saturating_mul(2));
    for seq in &unique {
        let kind = audit.get(*seq).map(|e| e.kind);
        assert!(matches!(
            kind,
            Some(EventKind::DecisionCommitted | EventKind::AuthSucceeded)
        ));
    }
    let created = events
        .iter()
        .filter(|e| e.kind == EventKind::CodeCreated)
        .count();
    assert_eq!(created, ROUNDS);
    let rounds = u64::try_from(ROUNDS).expect("rounds should fit");
    assert_eq!(core.qrnet().stats().codes, rounds);

    audit.verify_chain().expect("chain should verify");
    assert_eq!(core.governor().stats().evaluations, rounds);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn strict_switch_racing_evaluations_never_serves_the_old_decision() {
    let core = Arc::new(core());
    let warm = core
        .governor()
        .evaluate(EvalRequest::new(CRITICAL, "jit"))
        .await
        .expect("evaluate should succeed");
    let old_epoch = warm.record.policy_epoch;

    let mut tasks = JoinSet::new();
    for _ in 0..ROUNDS {
        let c = Arc::clone(&core);
        tasks.spawn(async move { c.governor().evaluate(EvalRequest::new(CRITICAL, "jit")).await });
    }
    let switch = {
        let c = Arc::clone(&core);
        tokio::spawn(async move { c.governor().set_strict(true) })
    };

    let change = switch
        .await
        .expect("task should not panic")
        .expect("policy change should log");
    assert!(change.audit_seq.is_some());

    while let Some(joined) = tasks.join_next().await {
        let eval = joined
            .expect("task should not panic")
            .expect("evaluate should succeed");
        if eval.record.policy_epoch == old_epoch {
            assert_eq!(eval.record.decision, warm.record.decision);
        } else {
            assert!(eval.record.policy_epoch > old_epoch);
            assert_eq!(eval.record.decision, Decision::Decline);
        }
    }

    // Whatever committed last, the cache only answers for the new policy.
    for _ in 0..2 {
        let after = core
            .governor()
            .evaluate(EvalRequest::new(CRITICAL, "jit"))
            .await
            .expect("evaluate should succeed");
        assert!(after.record.policy_epoch > old_epoch);
        assert_eq!(after.record.decision, Decision::Decline);
        assert!(matches!(
            after.record.decided_by,
            DecidedBy::StrictDeny | DecidedBy::Cache
        ));
    }
    core.audit().verify_chain().expect("chain should verify");
}
