//! Trend and advisory surface.
//!
//! Everything here is derived on demand from governor counters and the
//! recent tail of the audit log. Nothing is persisted.

use std::fmt;

use serde::Serialize;

use crate::clock::Tick;
use crate::geology::{AuditEvent, EventKind};
use crate::governor::types::{DecidedBy, Decision, DeclineReason, GovernorStats, ThreatLevel};

/// Slope above which the trend is rising (and below whose negation falling).
const SLOPE_THRESHOLD: f64 = 0.1;

/// Health penalty per declined decision in the tail.
const DECLINE_WEIGHT: u64 = 5;
/// Health penalty per CRITICAL threat in the tail.
const CRITICAL_WEIGHT: u64 = 10;
/// Health penalty per failed authentication in the tail.
const FAILED_AUTH_WEIGHT: u64 = 4;
/// Health penalty per failed code verification in the tail.
const FAILED_VERIFY_WEIGHT: u64 = 6;

/// Health below which the alert is critical.
const CRITICAL_HEALTH: u8 = 40;
/// Health below which the alert is a warning.
const WARNING_HEALTH: u8 = 70;

/// Direction of recent threat levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    /// Threat levels are climbing.
    Rising,
    /// No clear direction.
    Stable,
    /// Threat levels are dropping.
    Falling,
}

impl Trend {
    /// Upper-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rising => "RISING",
            Self::Stable => "STABLE",
            Self::Falling => "FALLING",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// Nothing to report.
    None,
    /// Worth a look.
    Warning,
    /// Needs attention now.
    Critical,
}

/// Counts taken from the audit tail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TailCounts {
    /// Events examined.
    pub events: usize,
    /// Decisions committed.
    pub decisions: u64,
    /// Of those, declines.
    pub declines: u64,
    /// Of those, at CRITICAL threat.
    pub critical_threats: u64,
    /// Failed authentications, lockouts included.
    pub failed_auths: u64,
    /// Failed code verifications.
    pub failed_verifications: u64,
}

/// Point-in-time advisory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advisory {
    /// Direction of recent threat levels.
    pub threat_trend: Trend,
    /// Least-squares slope of recent threat levels.
    pub slope: f64,
    /// 0 to 100; higher is healthier.
    pub health_score: u8,
    /// Alert level.
    pub alert_severity: AlertSeverity,
    /// One-line alert text.
    pub alert: String,
    /// Suggested next step.
    pub recommendation: &'static str,
    /// Tick of the last evaluation.
    pub last_scan_tick: Option<Tick>,
    /// What the tail contained.
    pub counts: TailCounts,
}

/// Least-squares slope of `levels` against their position. Zero for fewer
/// than two points.
pub fn slope(levels: &[f64]) -> f64 {
    if levels.len() < 2 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = levels.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = levels.iter().sum::<f64>() / n;
    let (num, den) = levels
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            #[allow(clippy::cast_precision_loss)]
            let dx = i as f64 - mean_x;
            (num + dx * (y - mean_y), den + dx * dx)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

/// Classify a slope.
pub fn trend_of(slope: f64) -> Trend {
    if slope > SLOPE_THRESHOLD {
        Trend::Rising
    } else if slope < -SLOPE_THRESHOLD {
        Trend::Falling
    } else {
        Trend::Stable
    }
}

/// Threat indices of the last `window` decisions in `tail`, oldest first.
pub fn recent_threats(tail: &[AuditEvent], window: usize) -> Vec<f64> {
    let mut levels: Vec<f64> = tail
        .iter()
        .rev()
        .filter(|e| e.kind == EventKind::DecisionCommitted)
        .filter_map(|e| e.payload_json()?.get("threat_index")?.as_u64())
        .take(window)
        .map(|i| f64::from(u32::try_from(i).unwrap_or(u32::MAX)))
        .collect();
    levels.reverse();
    levels
}

/// Tally the events in `tail`.
pub fn count_tail(tail: &[AuditEvent]) -> TailCounts {
    let critical = ThreatLevel::Critical.index();
    tail.iter().fold(
        TailCounts {
            events: tail.len(),
            ..TailCounts::default()
        },
        |mut c, e| {
            match e.kind {
                EventKind::DecisionCommitted => {
                    c.decisions = c.decisions.saturating_add(1);
                    let payload = e.payload_json();
                    let field = |k: &str| payload.as_ref().and_then(|p| p.get(k).cloned());
                    if field("decision").and_then(|v| v.as_str().map(str::to_owned)).as_deref()
                        == Some(Decision::Decline.as_str())
                    {
                        c.declines = c.declines.saturating_add(1);
                    }
                    let threat = field("threat_index").and_then(|v| v.as_u64());
                    if threat.and_then(|t| usize::try_from(t).ok()) == Some(critical) {
                        c.critical_threats = c.critical_threats.saturating_add(1);
                    }
                }
                EventKind::AuthFailed | EventKind::UserLockedOut => {
                    c.failed_auths = c.failed_auths.saturating_add(1);
                }
                EventKind::CodeVerifyFailed => {
                    c.failed_verifications = c.failed_verifications.saturating_add(1);
                }
                _ => {}
            }
            c
        },
    )
}

/// `100 - weighted(declines, critical threats, failed auths, failed
/// verifications)`, clamped to 0..=100.
pub fn health_score(c: &TailCounts) -> u8 {
    let penalty = c
        .declines
        .saturating_mul(DECLINE_WEIGHT)
        .saturating_add(c.critical_threats.saturating_mul(CRITICAL_WEIGHT))
        .saturating_add(c.failed_auths.saturating_mul(FAILED_AUTH_WEIGHT))
        .saturating_add(c.failed_verifications.saturating_mul(FAILED_VERIFY_WEIGHT));
    u8::try_from(100u64.saturating_sub(penalty)).unwrap_or(0)
}

/// Alert level and text for a health score and trend.
pub fn alert_for(health: u8, trend: Trend) -> (AlertSeverity, String) {
    if health < CRITICAL_HEALTH {
        (
            AlertSeverity::Critical,
            format!("CRITICAL: health {health}, threat trend {trend}"),
        )
    } else if health < WARNING_HEALTH {
        (
            AlertSeverity::Warning,
            format!("WARNING: health {health}, threat trend {trend}"),
        )
    } else if trend == Trend::Rising {
        (AlertSeverity::Warning, "WARNING: threat levels rising".to_owned())
    } else {
        (AlertSeverity::None, "All clear".to_owned())
    }
}

/// Recommendation from the trend and the most recent decision.
pub fn recommendation(
    trend: Trend,
    last: Option<(Decision, DecidedBy, Option<DeclineReason>)>,
) -> &'static str {
    match (trend, last) {
        (_, Some((Decision::Decline, _, Some(DeclineReason::Destructive)))) => {
            "Destructive operation blocked; use a suspend or archive operation instead"
        }
        (_, Some((Decision::Decline, _, Some(DeclineReason::ApprovalTimeout)))) => {
            "Approval timed out; review pending approvals"
        }
        (_, Some((Decision::Decline, _, Some(DeclineReason::NoApprover)))) => {
            "Interactive mode has no approver; attach one or switch to automatic mode"
        }
        (Trend::Rising, Some((Decision::Decline, DecidedBy::StrictDeny, _))) => {
            "Threats rising and strict mode is denying requests; audit recent submissions"
        }
        (Trend::Rising, _) => "Threat levels rising; consider enabling strict mode",
        (Trend::Falling, Some((Decision::Approve, _, _))) => {
            "Threat levels falling; current policy is working"
        }
        (_, Some((Decision::Decline, DecidedBy::User, _))) => {
            "Last request declined by the approver; review its capabilities"
        }
        (_, Some((Decision::Decline, _, _))) => "Last request declined; review its capabilities",
        (_, Some((Decision::Approve, _, _))) => "System nominal",
        (_, None) => "No evaluations yet",
    }
}

/// Build a snapshot from governor counters and an audit tail.
pub fn snapshot(stats: &GovernorStats, tail: &[AuditEvent], trend_window: usize) -> Advisory {
    let levels = recent_threats(tail, trend_window);
    let slope = slope(&levels);
    let threat_trend = trend_of(slope);
    let counts = count_tail(tail);
    let health_score = health_score(&counts);
    let (alert_severity, alert) = alert_for(health_score, threat_trend);
    Advisory {
        threat_trend,
        slope,
        health_score,
        alert_severity,
        alert,
        recommendation: recommendation(threat_trend, stats.last_decision),
        last_scan_tick: stats.last_scan_tick,
        counts,
    }
}
