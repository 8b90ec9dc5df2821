// src/decision.rs
//! Per-record arbitration between Stage 1, Stage 2 and the quota.
//!
//! Checks run cheapest first and the first match wins. Duplicates never get
//! here; they are decided upstream by the dedup step. The quota check is
//! advisory: the ledger re-checks atomically when the slot is reserved.

use crate::config::Thresholds;
use crate::model::{
    ClassificationVerdict, Decision, DecisionKind, QuotaState, ScoreResult, VerdictAction,
};

pub fn decide(
    score: &ScoreResult,
    verdict: Option<&ClassificationVerdict>,
    quota: &QuotaState,
    th: &Thresholds,
) -> Decision {
    if !score.passed {
        let reason = match &score.reason {
            Some(guard) => guard.clone(),
            None => format!("score {} < {}", score.score, th.filter1),
        };
        return Decision::new(DecisionKind::RejectFilter1, reason);
    }

    let v = match verdict {
        None => {
            return Decision::new(DecisionKind::RejectLlmThreshold, "classifier unavailable")
        }
        Some(v) if !v.is_valid() => {
            return Decision::new(DecisionKind::RejectLlmThreshold, "verdict invalid")
        }
        Some(v) => v,
    };

    if v.relevance < th.relevance {
        return Decision::new(
            DecisionKind::RejectLlmThreshold,
            format!("relevance {:.2} < {:.2}", v.relevance, th.relevance),
        );
    }
    if v.urgency < th.urgency {
        return Decision::new(
            DecisionKind::RejectLlmThreshold,
            format!("urgency {} < {}", v.urgency, th.urgency),
        );
    }
    if v.action == VerdictAction::Ignore {
        return Decision::new(DecisionKind::RejectLlmThreshold, "classifier action=ignore");
    }

    if quota.is_exhausted() {
        return Decision::new(
            DecisionKind::RejectQuota,
            format!("quota {}/{} used for {}", quota.count, quota.max, quota.date),
        );
    }

    Decision::new(
        DecisionKind::Accept,
        format!(
            "score {} relevance {:.2} urgency {}",
            score.score, v.relevance, v.urgency
        ),
    )
}

/// Used when the atomic reservation loses a race after an ACCEPT.
pub fn downgrade_to_quota(quota_max: u32) -> Decision {
    Decision::new(
        DecisionKind::RejectQuota,
        format!("daily quota of {quota_max} reached at reservation"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Validity;
    use chrono::NaiveDate;

    fn passed(score: i32) -> ScoreResult {
        ScoreResult {
            score,
            passed: true,
            ..Default::default()
        }
    }

    fn verdict(relevance: f32, urgency: u8) -> ClassificationVerdict {
        ClassificationVerdict {
            relevance,
            urgency,
            category: "accident".into(),
            object: "water".into(),
            why: String::new(),
            action: VerdictAction::Call,
            validity: Validity::Valid,
        }
    }

    fn quota(count: u32) -> QuotaState {
        QuotaState {
            date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            count,
            max: 5,
        }
    }

    #[test]
    fn filter1_failure_wins_over_everything() {
        let s = ScoreResult {
            score: 3,
            ..Default::default()
        };
        let d = decide(&s, Some(&verdict(0.9, 5)), &quota(5), &Thresholds::default());
        assert_eq!(d.kind, DecisionKind::RejectFilter1);
        assert_eq!(d.reason, "score 3 < 4");
    }

    #[test]
    fn guard_reason_is_carried() {
        let s = ScoreResult {
            score: 9,
            passed: false,
            reason: Some("STALE_NEWS".into()),
            ..Default::default()
        };
        let d = decide(&s, None, &quota(0), &Thresholds::default());
        assert_eq!(d.reason, "STALE_NEWS");
    }

    #[test]
    fn absent_or_invalid_verdict_fails_closed() {
        let th = Thresholds::default();
        assert_eq!(
            decide(&passed(5), None, &quota(0), &th).kind,
            DecisionKind::RejectLlmThreshold
        );
        let mut v = verdict(0.9, 5);
        v.validity = Validity::Invalid;
        assert_eq!(
            decide(&passed(5), Some(&v), &quota(0), &th).kind,
            DecisionKind::RejectLlmThreshold
        );
    }

    #[test]
    fn ignore_action_is_rejected() {
        let mut v = verdict(0.9, 5);
        v.action = VerdictAction::Ignore;
        let d = decide(&passed(5), Some(&v), &quota(0), &Thresholds::default());
        assert_eq!(d.kind, DecisionKind::RejectLlmThreshold);
    }

    #[test]
    fn thresholds_are_inclusive() {
        let d = decide(
            &passed(4),
            Some(&verdict(0.6, 3)),
            &quota(4),
            &Thresholds::default(),
        );
        assert!(d.is_accept());
    }

    #[test]
    fn exhausted_quota_rejects_last() {
        let d = decide(
            &passed(5),
            Some(&verdict(0.7, 4)),
            &quota(5),
            &Thresholds::default(),
        );
        assert_eq!(d.kind, DecisionKind::RejectQuota);
    }
}
