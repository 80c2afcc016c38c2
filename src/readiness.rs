//! Phase Readiness Validation
//!
//! Phases declare success criteria as data. Each criterion name resolves to
//! one [`CriterionKind`] through a lookup table built when the phase catalog
//! is constructed, so a typo in a definition fails at load time rather than
//! silently passing.
//!
//! Validation reads an immutable [`FlowSnapshot`] and returns verdicts; it
//! never mutates flow state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::observability::{EngineEvent, EventStatus, ObservabilitySink, Operation};
use crate::scoring::{self, round1, DecisionRecord, NEEDS_REVIEW_CONFIDENCE};

/// How many subject ids a recommendation lists before summarising
const MAX_LISTED_SUBJECTS: usize = 5;

/// Comparison applied between actual value and threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonSense {
    #[serde(alias = "gte", alias = ">=")]
    AtLeast,
    #[serde(alias = "lte", alias = "<=")]
    AtMost,
}

impl ComparisonSense {
    pub fn passes(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Self::AtLeast => actual >= threshold,
            Self::AtMost => actual <= threshold,
        }
    }
}

/// Closed set of criterion extractors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Aggregated flow readiness score
    ReadinessScore,
    /// Mean weighted questionnaire coverage across subjects
    QuestionnaireCoverage,
    /// Share of subjects at or above the review confidence
    ConfidenceCoverage,
    /// Share of processed items that failed
    ErrorRate,
    /// Share of subjects without a mapping
    UnmappedRatio,
    /// Share of subjects flagged high risk
    HighRiskRatio,
}

impl CriterionKind {
    pub const ALL: [CriterionKind; 6] = [
        Self::ReadinessScore,
        Self::QuestionnaireCoverage,
        Self::ConfidenceCoverage,
        Self::ErrorRate,
        Self::UnmappedRatio,
        Self::HighRiskRatio,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadinessScore => "readiness_score",
            Self::QuestionnaireCoverage => "questionnaire_coverage",
            Self::ConfidenceCoverage => "confidence_coverage",
            Self::ErrorRate => "error_rate",
            Self::UnmappedRatio => "unmapped_ratio",
            Self::HighRiskRatio => "high_risk_ratio",
        }
    }

    /// Scores and coverage must reach the threshold; error-like ratios must
    /// stay under it
    pub fn default_sense(&self) -> ComparisonSense {
        match self {
            Self::ReadinessScore | Self::QuestionnaireCoverage | Self::ConfidenceCoverage => {
                ComparisonSense::AtLeast
            }
            Self::ErrorRate | Self::UnmappedRatio | Self::HighRiskRatio => ComparisonSense::AtMost,
        }
    }

    /// Name -> extractor table. Accepts the bare name plus `min_`/`max_`
    /// prefixed forms, which is how phase files usually spell them. The
    /// prefix also fixes the comparison sense.
    pub fn lookup_table() -> HashMap<String, CriterionKind> {
        let mut table = HashMap::new();
        for kind in Self::ALL {
            table.insert(kind.as_str().to_string(), kind);
            table.insert(format!("min_{}", kind.as_str()), kind);
            table.insert(format!("max_{}", kind.as_str()), kind);
        }
        table
    }

    fn extract(&self, snapshot: &FlowSnapshot) -> f64 {
        let decisions = &snapshot.decisions;
        match self {
            Self::ReadinessScore => scoring::aggregate(decisions),
            Self::QuestionnaireCoverage => {
                if snapshot.coverage.is_empty() {
                    return 0.0;
                }
                let total: f64 = snapshot.coverage.values().sum();
                round1(total / snapshot.coverage.len() as f64)
            }
            Self::ConfidenceCoverage => percent(
                decisions.len() - scoring::needs_review(decisions).len(),
                decisions.len(),
            ),
            Self::ErrorRate => percent(snapshot.items_failed, snapshot.items_processed),
            Self::UnmappedRatio => percent(
                snapshot.subjects_total.saturating_sub(snapshot.subjects_mapped),
                snapshot.subjects_total,
            ),
            Self::HighRiskRatio => percent(scoring::high_risk(decisions).len(), decisions.len()),
        }
    }

    fn recommendation(&self, snapshot: &FlowSnapshot, actual: f64, threshold: f64) -> String {
        let decisions = &snapshot.decisions;
        match self {
            Self::ReadinessScore => {
                let review = scoring::needs_review(decisions);
                let unresolved = decisions
                    .values()
                    .filter(|d| d.has_unresolved_issues())
                    .count();
                format!(
                    "Raise the readiness score from {:.1} to at least {:.1}: review {} subject(s) with confidence below {} ({}) and resolve compatibility issues on {} subject(s)",
                    actual,
                    threshold,
                    review.len(),
                    NEEDS_REVIEW_CONFIDENCE,
                    list_ids(&review),
                    unresolved
                )
            }
            Self::QuestionnaireCoverage => {
                let lagging: Vec<Uuid> = snapshot
                    .coverage
                    .iter()
                    .filter(|(_, c)| **c < threshold)
                    .map(|(id, _)| *id)
                    .collect();
                format!(
                    "Questionnaire coverage is {:.1}% but {:.1}% is required: complete outstanding questions for {} subject(s) ({})",
                    actual,
                    threshold,
                    lagging.len(),
                    list_ids(&lagging)
                )
            }
            Self::ConfidenceCoverage => {
                let review = scoring::needs_review(decisions);
                format!(
                    "Only {:.1}% of subjects have confidence of at least {} ({:.1}% required): re-validate answers for {}",
                    actual,
                    NEEDS_REVIEW_CONFIDENCE,
                    threshold,
                    list_ids(&review)
                )
            }
            Self::ErrorRate => format!(
                "{} of {} processed items failed ({:.1}%, limit {:.1}%): fix and reprocess the failed items before advancing",
                snapshot.items_failed, snapshot.items_processed, actual, threshold
            ),
            Self::UnmappedRatio => format!(
                "{} of {} subjects have no mapping ({:.1}%, limit {:.1}%): map the remaining subjects before advancing",
                snapshot.subjects_total.saturating_sub(snapshot.subjects_mapped),
                snapshot.subjects_total,
                actual,
                threshold
            ),
            Self::HighRiskRatio => {
                let risky = scoring::high_risk(decisions);
                format!(
                    "{:.1}% of subjects are high risk (limit {:.1}%): mitigate the risk factors recorded for {}",
                    actual,
                    threshold,
                    list_ids(&risky)
                )
            }
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round1(part as f64 * 100.0 / whole as f64)
}

fn list_ids(ids: &[Uuid]) -> String {
    if ids.is_empty() {
        return "none listed".to_string();
    }
    let mut listed: Vec<String> = ids
        .iter()
        .take(MAX_LISTED_SUBJECTS)
        .map(Uuid::to_string)
        .collect();
    if ids.len() > MAX_LISTED_SUBJECTS {
        listed.push(format!("and {} more", ids.len() - MAX_LISTED_SUBJECTS));
    }
    listed.join(", ")
}

/// Criterion as written in a phase definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionDef {
    /// Must be numeric; kept loose so a bad value is reported as invalid input
    pub threshold: serde_json::Value,
    #[serde(default)]
    pub sense: Option<ComparisonSense>,
    #[serde(default)]
    pub description: String,
    /// Extractor name when it differs from the criterion name
    #[serde(default)]
    pub extractor: Option<String>,
}

/// Phase as written in a definition file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    pub ordinal: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub criteria: BTreeMap<String, CriterionDef>,
}

/// Criterion after its extractor and threshold were resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Criterion {
    pub name: String,
    pub kind: CriterionKind,
    pub threshold: f64,
    pub sense: ComparisonSense,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Phase {
    pub name: String,
    pub ordinal: u32,
    pub description: String,
    pub criteria: Vec<Criterion>,
}

/// Read access to phase definitions
pub trait PhaseDefinitionProvider: Send + Sync {
    fn phase(&self, name: &str) -> Option<&Phase>;

    /// All phases in ordinal order
    fn phases(&self) -> &[Phase];

    fn criteria(&self, name: &str) -> Option<&[Criterion]> {
        self.phase(name).map(|p| p.criteria.as_slice())
    }
}

/// Validated, ordinal-ordered phase definitions
#[derive(Debug, Clone, Default)]
pub struct PhaseCatalog {
    phases: Vec<Phase>,
}

impl PhaseCatalog {
    pub fn new(definitions: Vec<PhaseDefinition>) -> Result<Self, EngineError> {
        let table = CriterionKind::lookup_table();
        let mut ordinals = BTreeSet::new();
        let mut names = BTreeSet::new();
        let mut phases = Vec::with_capacity(definitions.len());

        for def in definitions {
            if def.name.trim().is_empty() {
                return Err(EngineError::invalid("phase name must not be empty"));
            }
            if !names.insert(def.name.clone()) {
                return Err(EngineError::invalid(format!("duplicate phase '{}'", def.name)));
            }
            if !ordinals.insert(def.ordinal) {
                return Err(EngineError::invalid(format!(
                    "phase '{}' reuses ordinal {}",
                    def.name, def.ordinal
                )));
            }

            let mut criteria = Vec::with_capacity(def.criteria.len());
            for (name, c) in def.criteria {
                let key = c.extractor.as_deref().unwrap_or(&name);
                let kind = *table.get(key).ok_or_else(|| {
                    EngineError::invalid(format!(
                        "phase '{}' criterion '{}' has no extractor named '{}'",
                        def.name, name, key
                    ))
                })?;
                let threshold = parse_threshold(&def.name, &name, &c.threshold)?;
                let sense = resolve_sense(&def.name, &name, &c, kind)?;
                criteria.push(Criterion {
                    name,
                    kind,
                    threshold,
                    sense,
                    description: c.description,
                });
            }

            phases.push(Phase {
                name: def.name,
                ordinal: def.ordinal,
                description: def.description,
                criteria,
            });
        }

        phases.sort_by_key(|p| p.ordinal);
        Ok(Self { phases })
    }
}

impl PhaseDefinitionProvider for PhaseCatalog {
    fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    fn phases(&self) -> &[Phase] {
        &self.phases
    }
}

/// Sense implied by a `min_`/`max_` name prefix
fn prefix_sense(name: &str) -> Option<ComparisonSense> {
    if name.starts_with("min_") {
        Some(ComparisonSense::AtLeast)
    } else if name.starts_with("max_") {
        Some(ComparisonSense::AtMost)
    } else {
        None
    }
}

/// Explicit sense, else the name prefix, else the extractor default. A prefix
/// that contradicts the explicit sense or the extractor name is rejected.
fn resolve_sense(
    phase: &str,
    criterion: &str,
    def: &CriterionDef,
    kind: CriterionKind,
) -> Result<ComparisonSense, EngineError> {
    let mut implied = prefix_sense(criterion);
    if let Some(from_extractor) = def.extractor.as_deref().and_then(prefix_sense) {
        if implied.is_some_and(|s| s != from_extractor) {
            return Err(EngineError::invalid(format!(
                "phase '{}' criterion '{}' contradicts its extractor '{}'",
                phase,
                criterion,
                def.extractor.as_deref().unwrap_or_default()
            )));
        }
        implied = Some(from_extractor);
    }
    match (def.sense, implied) {
        (Some(explicit), Some(prefixed)) if explicit != prefixed => Err(EngineError::invalid(
            format!(
                "phase '{}' criterion '{}' is declared {:?} but its name implies {:?}",
                phase, criterion, explicit, prefixed
            ),
        )),
        (Some(explicit), _) => Ok(explicit),
        (None, Some(prefixed)) => Ok(prefixed),
        (None, None) => Ok(kind.default_sense()),
    }
}

fn parse_threshold(
    phase: &str,
    criterion: &str,
    raw: &serde_json::Value,
) -> Result<f64, EngineError> {
    let value = match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(v) if v.is_finite() && (0.0..=100.0).contains(&v) => Ok(v),
        Some(v) => Err(EngineError::invalid(format!(
            "phase '{}' criterion '{}' threshold {} is outside 0..=100",
            phase, criterion, v
        ))),
        None => Err(EngineError::invalid(format!(
            "phase '{}' criterion '{}' threshold {} is not numeric",
            phase, criterion, raw
        ))),
    }
}

/// Immutable view of flow state handed to the validator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    #[serde(default)]
    pub flow_id: Option<Uuid>,
    pub current_phase: String,
    #[serde(default)]
    pub completed_phases: BTreeSet<String>,
    #[serde(default)]
    pub decisions: BTreeMap<Uuid, DecisionRecord>,
    /// Weighted questionnaire coverage (0..=100) per subject
    #[serde(default)]
    pub coverage: BTreeMap<Uuid, f64>,
    #[serde(default)]
    pub subjects_total: usize,
    #[serde(default)]
    pub subjects_mapped: usize,
    #[serde(default)]
    pub items_processed: usize,
    #[serde(default)]
    pub items_failed: usize,
}

impl FlowSnapshot {
    pub fn new(current_phase: impl Into<String>) -> Self {
        Self {
            current_phase: current_phase.into(),
            ..Self::default()
        }
    }

    pub fn is_complete(&self, phase: &str) -> bool {
        self.completed_phases.contains(phase)
    }

    fn validate(&self) -> Result<(), EngineError> {
        for (id, d) in &self.decisions {
            if !d.confidence.is_finite() || !(0.0..=1.0).contains(&d.confidence) {
                return Err(EngineError::invalid(format!(
                    "subject {} confidence {} is outside 0..=1",
                    id, d.confidence
                )));
            }
        }
        for (id, c) in &self.coverage {
            if !c.is_finite() || !(0.0..=100.0).contains(c) {
                return Err(EngineError::invalid(format!(
                    "subject {} coverage {} is outside 0..=100",
                    id, c
                )));
            }
        }
        if self.subjects_mapped > self.subjects_total {
            return Err(EngineError::invalid(format!(
                "{} mapped subjects exceed {} total",
                self.subjects_mapped, self.subjects_total
            )));
        }
        if self.items_failed > self.items_processed {
            return Err(EngineError::invalid(format!(
                "{} failed items exceed {} processed",
                self.items_failed, self.items_processed
            )));
        }
        Ok(())
    }
}

/// Why a phase verdict failed without evaluating criteria
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    NotCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionResult {
    pub name: String,
    pub required: f64,
    pub actual: f64,
    pub passed: bool,
    pub sense: ComparisonSense,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessVerdict {
    pub phase: String,
    pub success: bool,
    pub criteria: Vec<CriterionResult>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<VerdictReason>,
}

/// Readiness across every phase up to the current one
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowStatus {
    pub current_phase: String,
    pub phases: Vec<ReadinessVerdict>,
    pub overall_success: bool,
    pub flow_score: f64,
    pub needs_review: Vec<Uuid>,
    pub high_risk: Vec<Uuid>,
    /// Next phase by ordinal, when the flow may move on
    pub next_phase: Option<String>,
}

impl FlowStatus {
    pub fn can_advance(&self) -> bool {
        self.overall_success && self.next_phase.is_some()
    }
}

pub struct PhaseReadinessValidator {
    phases: Arc<dyn PhaseDefinitionProvider>,
    sink: Arc<dyn ObservabilitySink>,
}

impl PhaseReadinessValidator {
    pub fn new(phases: Arc<dyn PhaseDefinitionProvider>, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self { phases, sink }
    }

    /// Evaluate every criterion of a phase against the snapshot
    pub fn validate_phase(
        &self,
        phase_name: &str,
        snapshot: &FlowSnapshot,
    ) -> Result<ReadinessVerdict, EngineError> {
        let phase = self
            .phases
            .phase(phase_name)
            .ok_or_else(|| EngineError::not_found("phase", phase_name))?;
        snapshot.validate()?;

        let started = Instant::now();
        let verdict = evaluate(phase, snapshot);
        if !verdict.success {
            self.report_failure(snapshot, &verdict, started);
        }
        Ok(verdict)
    }

    /// Walk phases in ordinal order up to the current phase. Phases not yet
    /// marked complete fail as `not_completed` without running extractors.
    pub fn overall_status(&self, snapshot: &FlowSnapshot) -> Result<FlowStatus, EngineError> {
        let current = self
            .phases
            .phase(&snapshot.current_phase)
            .ok_or_else(|| EngineError::not_found("phase", snapshot.current_phase.as_str()))?;
        snapshot.validate()?;

        let mut verdicts = Vec::new();
        for phase in self
            .phases
            .phases()
            .iter()
            .filter(|p| p.ordinal <= current.ordinal)
        {
            let started = Instant::now();
            let verdict = if snapshot.is_complete(&phase.name) {
                evaluate(phase, snapshot)
            } else {
                debug!(phase = %phase.name, "phase not completed, skipping criteria");
                ReadinessVerdict {
                    phase: phase.name.clone(),
                    success: false,
                    criteria: Vec::new(),
                    recommendations: vec![format!(
                        "Complete phase '{}' before its readiness can be assessed",
                        phase.name
                    )],
                    reason: Some(VerdictReason::NotCompleted),
                }
            };
            if !verdict.success {
                self.report_failure(snapshot, &verdict, started);
            }
            verdicts.push(verdict);
        }

        let overall_success = verdicts.iter().all(|v| v.success);
        let next_phase = self
            .phases
            .phases()
            .iter()
            .find(|p| p.ordinal > current.ordinal)
            .map(|p| p.name.clone());

        Ok(FlowStatus {
            current_phase: current.name.clone(),
            phases: verdicts,
            overall_success,
            flow_score: scoring::aggregate(&snapshot.decisions),
            needs_review: scoring::needs_review(&snapshot.decisions),
            high_risk: scoring::high_risk(&snapshot.decisions),
            next_phase,
        })
    }

    fn report_failure(&self, snapshot: &FlowSnapshot, verdict: &ReadinessVerdict, started: Instant) {
        let failed: Vec<&str> = verdict
            .criteria
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        let detail = match verdict.reason {
            Some(VerdictReason::NotCompleted) => format!("{}: not_completed", verdict.phase),
            None => format!("{}: failed {}", verdict.phase, failed.join(", ")),
        };
        self.sink.emit(EngineEvent::new(
            snapshot.flow_id,
            Operation::PhaseValidation,
            EventStatus::Failed,
            started.elapsed(),
            detail,
        ));
    }
}

fn evaluate(phase: &Phase, snapshot: &FlowSnapshot) -> ReadinessVerdict {
    let mut results = Vec::with_capacity(phase.criteria.len());
    let mut recommendations = Vec::new();

    for criterion in &phase.criteria {
        let actual = criterion.kind.extract(snapshot);
        let passed = criterion.sense.passes(actual, criterion.threshold);
        if !passed {
            recommendations.push(criterion.kind.recommendation(snapshot, actual, criterion.threshold));
        }
        results.push(CriterionResult {
            name: criterion.name.clone(),
            required: criterion.threshold,
            actual,
            passed,
            sense: criterion.sense,
            description: criterion.description.clone(),
        });
    }

    ReadinessVerdict {
        phase: phase.name.clone(),
        success: results.iter().all(|r| r.passed),
        criteria: results,
        recommendations,
        reason: None,
    }
}
