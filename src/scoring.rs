//! Readiness Score Aggregation
//!
//! Rolls per-subject decision records up into a single flow score in
//! [0, 100]. Groupings such as "needs review" are derived on demand and
//! never stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Risk factor keywords that mark a subject as high risk (case-insensitive)
pub const HIGH_RISK_KEYWORDS: [&str; 5] =
    ["legacy", "deprecated", "unsupported", "critical", "security"];

/// Subjects below this confidence need a human review
pub const NEEDS_REVIEW_CONFIDENCE: f64 = 0.8;

const TECH_DEBT_LIMIT: f64 = 70.0;
const TECH_DEBT_PENALTY: f64 = 20.0;
const HIGH_RISK_PENALTY: f64 = 15.0;
const COMPATIBILITY_PENALTY: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub description: String,
    #[serde(default)]
    pub resolved: bool,
}

/// Decision state for one subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub tech_debt_score: Option<f64>,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub compatibility_issues: Vec<CompatibilityIssue>,
}

impl DecisionRecord {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            tech_debt_score: None,
            risk_factors: Vec::new(),
            compatibility_issues: Vec::new(),
        }
    }

    pub fn with_tech_debt(mut self, score: f64) -> Self {
        self.tech_debt_score = Some(score);
        self
    }

    pub fn with_risk(mut self, factor: impl Into<String>) -> Self {
        self.risk_factors.push(factor.into());
        self
    }

    pub fn with_issue(mut self, description: impl Into<String>, resolved: bool) -> Self {
        self.compatibility_issues.push(CompatibilityIssue {
            description: description.into(),
            resolved,
        });
        self
    }

    pub fn is_high_risk(&self) -> bool {
        self.risk_factors.iter().any(|factor| {
            let factor = factor.to_lowercase();
            HIGH_RISK_KEYWORDS.iter().any(|k| factor.contains(k))
        })
    }

    pub fn needs_review(&self) -> bool {
        self.confidence < NEEDS_REVIEW_CONFIDENCE
    }

    pub fn has_unresolved_issues(&self) -> bool {
        self.compatibility_issues.iter().any(|i| !i.resolved)
    }

    /// Score in [0, 100]
    pub fn score(&self) -> f64 {
        let confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut score = confidence * 100.0;

        if self.tech_debt_score.is_some_and(|debt| debt > TECH_DEBT_LIMIT) {
            score -= TECH_DEBT_PENALTY;
        }
        if self.is_high_risk() {
            score -= HIGH_RISK_PENALTY;
        }
        if self.has_unresolved_issues() {
            score -= COMPATIBILITY_PENALTY;
        }
        score.max(0.0)
    }
}

/// Flow score: mean subject score rounded to one decimal, `0.0` when empty
pub fn aggregate(decisions: &BTreeMap<Uuid, DecisionRecord>) -> f64 {
    if decisions.is_empty() {
        return 0.0;
    }
    let total: f64 = decisions.values().map(DecisionRecord::score).sum();
    round1(total / decisions.len() as f64)
}

pub fn needs_review(decisions: &BTreeMap<Uuid, DecisionRecord>) -> Vec<Uuid> {
    decisions
        .iter()
        .filter(|(_, d)| d.needs_review())
        .map(|(id, _)| *id)
        .collect()
}

pub fn high_risk(decisions: &BTreeMap<Uuid, DecisionRecord>) -> Vec<Uuid> {
    decisions
        .iter()
        .filter(|(_, d)| d.is_high_risk())
        .map(|(id, _)| *id)
        .collect()
}

pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
