//! Tests for the advisory snapshot over a live core.

use phantom_trust::advisory::{AlertSeverity, Trend};
use phantom_trust::dnauth::sequence::MatchMode;
use phantom_trust::dnauth::verifier::KdfParams;
use phantom_trust::governor::EvalRequest;

use super::core;

#[test]
fn idle_core_is_all_clear() {
    let core = core();
    let advisory = core.advisory();
    assert_eq!(advisory.threat_trend, Trend::Stable);
    assert_eq!(advisory.health_score, 100);
    assert_eq!(advisory.alert_severity, AlertSeverity::None);
    assert_eq!(advisory.alert, "All clear");
    assert_eq!(advisory.recommendation, "No evaluations yet");
    assert_eq!(advisory.last_scan_tick, None);
}

#[tokio::test]
async fn escalating_threats_raise_a_warning() {
    let core = core();
    for text in [
        "int x = 1;",
        "read_file(\"/etc/host\")",
        "mprotect(p, n, PROT_EXEC); connect(s, a);",
    ] {
        core.governor()
            .evaluate(EvalRequest::new(text, "step"))
            .await
            .expect("evaluate should succeed");
    }
    let advisory = core.advisory();
    assert_eq!(advisory.threat_trend, Trend::Rising);
    assert!(advisory.slope > 0.1);
    assert_eq!(advisory.counts.decisions, 3);
    assert_eq!(advisory.counts.critical_threats, 1);
    assert_eq!(advisory.health_score, 90);
    assert_eq!(advisory.alert_severity, AlertSeverity::Warning);
    assert_eq!(advisory.alert, "WARNING: threat levels rising");
    assert_eq!(
        advisory.recommendation,
        "Threat levels rising; consider enabling strict mode"
    );
    assert_eq!(advisory.last_scan_tick, Some(100_000));
}

#[tokio::test]
async fn destructive_decline_drives_the_recommendation() {
    let core = core();
    core.governor()
        .evaluate(EvalRequest::new("unlink(\"/x\")", "rm"))
        .await
        .expect("evaluate should succeed");
    let advisory = core.advisory();
    assert_eq!(advisory.counts.declines, 1);
    assert!(advisory.recommendation.starts_with("Destructive operation blocked"));
}

#[test]
fn failed_logins_lower_health() {
    let core = core();
    core.dnauth()
        .register("alice", "ATGCATGCATGC", MatchMode::Exact, KdfParams { iterations: 16 })
        .expect("register should succeed");
    for _ in 0..5 {
        assert!(core.dnauth().authenticate("alice", "GGGGATGCATGC").is_err());
    }
    let advisory = core.advisory();
    assert_eq!(advisory.counts.failed_auths, 5);
    assert_eq!(advisory.health_score, 80);
    assert_eq!(advisory.alert_severity, AlertSeverity::None);
}
