//! Pre-publish stability gate.
//!
//! A pure decision function over already-computed scores plus the batch's own
//! drafts: no generation, no scraping, no store access. A draft passes when
//! quality and compliance meet their minimums, repetition stays under its
//! maximum, and no earlier passing draft in the batch targeting the same
//! platform is a near-duplicate of it. Within a near-duplicate cluster the
//! first passing draft in batch order is the leader; the rest are rejected
//! with a reason naming it.

use std::collections::HashMap;

use uuid::Uuid;

use crate::config::GateConfig;
use crate::dedup::{hamming_distance, simhash};
use crate::draft::ContentDraft;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateVerdict {
    Approved,
    Rejected { reasons: Vec<String> },
}

impl GateVerdict {
    pub fn is_approved(&self) -> bool {
        matches!(self, GateVerdict::Approved)
    }
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub draft_id: Uuid,
    pub verdict: GateVerdict,
}

/// Evaluate one publish batch. Decisions come back in input order.
pub fn evaluate_batch(drafts: &[ContentDraft], config: &GateConfig) -> Vec<GateDecision> {
    // Accepted fingerprints per platform: (leader draft id, simhash).
    let mut leaders: HashMap<String, Vec<(Uuid, u64)>> = HashMap::new();
    let mut decisions = Vec::with_capacity(drafts.len());

    for draft in drafts {
        let mut reasons = Vec::new();

        if !draft.gate_eligible {
            reasons.push("draft not gate-eligible (generation checks failed)".to_string());
        }
        if draft.quality_score < config.min_quality_score {
            reasons.push(format!(
                "quality {:.2} below minimum {:.2}",
                draft.quality_score, config.min_quality_score
            ));
        }
        if draft.compliance_score < config.min_compliance_score {
            reasons.push(format!(
                "compliance {:.2} below minimum {:.2}",
                draft.compliance_score, config.min_compliance_score
            ));
        }
        if draft.repetition_ratio > config.max_repetition_ratio {
            reasons.push(format!(
                "repetition {:.2} above maximum {:.2}",
                draft.repetition_ratio, config.max_repetition_ratio
            ));
        }

        // Near-duplicate blocking only among drafts that passed the
        // threshold checks: a rejected draft must not shadow a good one.
        if reasons.is_empty() {
            let fingerprint = simhash(&draft.dedup_text());
            let platform_leaders = leaders
                .entry(draft.target_platform.to_lowercase())
                .or_default();
            let duplicate_of = platform_leaders.iter().find(|(_, leader_fp)| {
                fingerprint != 0
                    && hamming_distance(fingerprint, *leader_fp) <= config.near_duplicate_hamming
            });
            match duplicate_of {
                Some((leader_id, _)) => {
                    reasons.push(format!("near-duplicate of draft {leader_id} in batch"));
                }
                None => {
                    platform_leaders.push((draft.id, fingerprint));
                }
            }
        }

        decisions.push(GateDecision {
            draft_id: draft.id,
            verdict: if reasons.is_empty() {
                GateVerdict::Approved
            } else {
                GateVerdict::Rejected { reasons }
            },
        });
    }

    decisions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(platform: &str, quality: f64, compliance: f64, repetition: f64) -> ContentDraft {
        let mut draft = ContentDraft::new(Uuid::new_v4(), platform);
        draft.title = format!("draft {}", draft.id);
        draft.body = format!(
            "a sufficiently distinctive body about topic {} with enough words to fingerprint",
            draft.id
        );
        draft.quality_score = quality;
        draft.compliance_score = compliance;
        draft.repetition_ratio = repetition;
        draft.gate_eligible = true;
        draft
    }

    fn config() -> GateConfig {
        GateConfig {
            min_quality_score: 0.60,
            min_compliance_score: 0.80,
            max_repetition_ratio: 0.85,
            near_duplicate_hamming: 5,
        }
    }

    #[test]
    fn test_quality_threshold() {
        let below = draft("wechat", 0.50, 0.9, 0.1);
        let decisions = evaluate_batch(std::slice::from_ref(&below), &config());
        let GateVerdict::Rejected { reasons } = &decisions[0].verdict else {
            panic!("expected rejection");
        };
        assert!(reasons[0].contains("quality"));

        // Raising quality with other scores passing makes it eligible.
        let mut above = below.clone();
        above.quality_score = 0.65;
        let decisions = evaluate_batch(&[above], &config());
        assert!(decisions[0].verdict.is_approved());
    }

    #[test]
    fn test_compliance_and_repetition_thresholds() {
        let bad_compliance = draft("wechat", 0.9, 0.5, 0.1);
        let bad_repetition = draft("wechat", 0.9, 0.9, 0.95);
        let decisions = evaluate_batch(&[bad_compliance, bad_repetition], &config());
        assert!(!decisions[0].verdict.is_approved());
        assert!(!decisions[1].verdict.is_approved());
    }

    #[test]
    fn test_gate_ineligible_draft_is_rejected() {
        let mut ineligible = draft("wechat", 0.9, 0.9, 0.1);
        ineligible.gate_eligible = false;
        let decisions = evaluate_batch(&[ineligible], &config());
        assert!(!decisions[0].verdict.is_approved());
    }

    #[test]
    fn test_near_duplicates_same_platform_block_all_but_leader() {
        let mut a = draft("wechat", 0.9, 0.9, 0.1);
        let mut b = draft("wechat", 0.9, 0.9, 0.1);
        a.title = "Rust release roundup".into();
        b.title = "Rust release roundup".into();
        let body = "the new compiler release brings faster builds and better errors for everyone";
        a.body = body.into();
        b.body = body.into();

        let decisions = evaluate_batch(&[a.clone(), b.clone()], &config());
        assert!(decisions[0].verdict.is_approved(), "leader proceeds");
        let GateVerdict::Rejected { reasons } = &decisions[1].verdict else {
            panic!("duplicate should be rejected");
        };
        assert!(
            reasons[0].contains(&a.id.to_string()),
            "rejection must reference the cluster leader, got: {reasons:?}"
        );
    }

    #[test]
    fn test_same_content_different_platform_both_pass() {
        let mut a = draft("wechat", 0.9, 0.9, 0.1);
        let mut b = draft("weibo", 0.9, 0.9, 0.1);
        let body = "the new compiler release brings faster builds and better errors for everyone";
        a.body = body.into();
        b.body = body.into();
        a.title = "Rust release roundup".into();
        b.title = "Rust release roundup".into();

        let decisions = evaluate_batch(&[a, b], &config());
        assert!(decisions.iter().all(|d| d.verdict.is_approved()));
    }

    #[test]
    fn test_threshold_rejected_draft_is_not_a_cluster_leader() {
        let mut rejected = draft("wechat", 0.2, 0.9, 0.1);
        let mut good = draft("wechat", 0.9, 0.9, 0.1);
        let body = "identical body text used by both the failing and the passing draft here";
        rejected.body = body.into();
        good.body = body.into();
        rejected.title = "Same title".into();
        good.title = "Same title".into();

        let decisions = evaluate_batch(&[rejected, good], &config());
        assert!(!decisions[0].verdict.is_approved());
        assert!(
            decisions[1].verdict.is_approved(),
            "a threshold-rejected draft must not shadow a passing one"
        );
    }

    #[test]
    fn test_empty_batch() {
        assert!(evaluate_batch(&[], &config()).is_empty());
    }
}
