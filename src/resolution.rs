//! Question Resolution
//!
//! Works out which questions a subject still needs to answer. The
//! deterministic part is catalog minus answered ids; the optional pruning
//! step asks the inference service to narrow the set further and falls back
//! to the full set on any failure.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::{CatalogProvider, QuestionRule};
use crate::error::EngineError;
use crate::inference::{Deadline, InferenceRequest, InferenceService, SubjectSnapshot};
use crate::ledger::{AnswerRecord, LedgerProvider};
use crate::observability::{
    EngineEvent, EventStatus, FallbackCounters, ObservabilitySink, Operation,
};

/// How a question set was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    /// Pruning was not asked for (or there was nothing to resolve)
    NotRequested,
    /// Pruning ran and its answer was applied
    Completed,
    /// Pruning failed; the unpruned set was returned
    Fallback,
}

/// Outstanding questions for a subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionSet {
    pub items: Vec<QuestionRule>,
    pub status: ResolutionStatus,
    pub fallback_used: bool,
}

impl QuestionSet {
    fn new(items: Vec<QuestionRule>, status: ResolutionStatus) -> Self {
        Self {
            items,
            fallback_used: status == ResolutionStatus::Fallback,
            status,
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|r| r.question_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Parameters for [`QuestionResolutionService::resolve_with`]
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub subject_id: Uuid,
    pub subject_type: String,
    pub include_answered: bool,
    pub allow_pruning: bool,
    /// Caller budget for the pruning step; applied only if shorter than the
    /// configured deadline
    pub timeout: Option<Duration>,
}

impl ResolveRequest {
    pub fn new(subject_id: Uuid, subject_type: impl Into<String>) -> Self {
        Self {
            subject_id,
            subject_type: subject_type.into(),
            include_answered: false,
            allow_pruning: false,
            timeout: None,
        }
    }

    pub fn include_answered(mut self, include: bool) -> Self {
        self.include_answered = include;
        self
    }

    pub fn allow_pruning(mut self, allow: bool) -> Self {
        self.allow_pruning = allow;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Answer progress for one subject
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuestionnaireProgress {
    pub total: usize,
    pub answered: usize,
    pub required_total: usize,
    pub required_answered: usize,
    /// Answered weight over total weight, 0..=100
    pub weighted_coverage: f64,
}

impl QuestionnaireProgress {
    pub fn required_complete(&self) -> bool {
        self.required_answered == self.required_total
    }
}

pub struct QuestionResolutionService {
    catalog: Arc<dyn CatalogProvider>,
    ledger: Arc<dyn LedgerProvider>,
    inference: Arc<dyn InferenceService>,
    sink: Arc<dyn ObservabilitySink>,
    counters: Arc<FallbackCounters>,
    deadline: Deadline,
}

impl QuestionResolutionService {
    pub fn new(
        catalog: Arc<dyn CatalogProvider>,
        ledger: Arc<dyn LedgerProvider>,
        inference: Arc<dyn InferenceService>,
        sink: Arc<dyn ObservabilitySink>,
        counters: Arc<FallbackCounters>,
        deadline: Deadline,
    ) -> Self {
        Self {
            catalog,
            ledger,
            inference,
            sink,
            counters,
            deadline,
        }
    }

    /// Outstanding questions for a subject
    pub async fn resolve(
        &self,
        subject_id: Uuid,
        subject_type: &str,
        include_answered: bool,
        allow_pruning: bool,
    ) -> Result<QuestionSet, EngineError> {
        self.resolve_with(
            ResolveRequest::new(subject_id, subject_type)
                .include_answered(include_answered)
                .allow_pruning(allow_pruning),
        )
        .await
    }

    pub async fn resolve_with(&self, request: ResolveRequest) -> Result<QuestionSet, EngineError> {
        let rules = self.catalog.rules(&request.subject_type);
        if rules.is_empty() {
            debug!(
                subject_id = %request.subject_id,
                subject_type = %request.subject_type,
                "no catalog rules for subject type"
            );
            return Ok(QuestionSet::new(Vec::new(), ResolutionStatus::NotRequested));
        }

        let answers = self.load_answers(request.subject_id).await?;
        let answered = answered_ids(&answers);

        let items: Vec<QuestionRule> = if request.include_answered {
            rules
        } else {
            rules
                .into_iter()
                .filter(|r| !answered.contains(r.question_id.as_str()))
                .collect()
        };

        if !request.allow_pruning {
            return Ok(QuestionSet::new(items, ResolutionStatus::NotRequested));
        }
        if items.is_empty() {
            return Ok(QuestionSet::new(items, ResolutionStatus::Completed));
        }

        let snapshot = SubjectSnapshot {
            subject_id: request.subject_id,
            subject_type: Some(request.subject_type.clone()),
            answers: answered_values(&answers),
        };
        Ok(self
            .prune(snapshot, items, self.deadline.tightened(request.timeout))
            .await)
    }

    /// Ask the inference service which items are still relevant.
    ///
    /// Never fails: any error or timeout yields the full input set.
    async fn prune(
        &self,
        subject: SubjectSnapshot,
        items: Vec<QuestionRule>,
        deadline: Deadline,
    ) -> QuestionSet {
        let subject_id = subject.subject_id;
        let request = InferenceRequest {
            subject,
            candidate_ids: items.iter().map(|r| r.question_id.clone()).collect(),
            change: None,
            deadline_ms: deadline.budget().as_millis() as u64,
        };

        let started = Instant::now();
        match deadline.run(self.inference.relevant_questions(&request)).await {
            Ok(relevant) => {
                // Keep input order; ids the service made up are ignored
                let relevant: HashSet<&str> = relevant.iter().map(String::as_str).collect();
                let pruned: Vec<QuestionRule> = items
                    .into_iter()
                    .filter(|r| relevant.contains(r.question_id.as_str()))
                    .collect();
                debug!(
                    %subject_id,
                    candidates = request.candidate_ids.len(),
                    kept = pruned.len(),
                    "pruning completed"
                );
                QuestionSet::new(pruned, ResolutionStatus::Completed)
            }
            Err(e) => {
                warn!(%subject_id, error = %e, "pruning failed, returning unpruned set");
                self.counters.record(Operation::Prune);
                self.sink.emit(EngineEvent::new(
                    Some(subject_id),
                    Operation::Prune,
                    EventStatus::Fallback,
                    started.elapsed(),
                    e.to_string(),
                ));
                QuestionSet::new(items, ResolutionStatus::Fallback)
            }
        }
    }

    /// Answer progress against the catalog for a subject type
    pub async fn progress(
        &self,
        subject_id: Uuid,
        subject_type: &str,
    ) -> Result<QuestionnaireProgress, EngineError> {
        let rules = self.catalog.rules(subject_type);
        let answers = self.load_answers(subject_id).await?;
        let answered = answered_ids(&answers);

        let mut progress = QuestionnaireProgress {
            total: rules.len(),
            answered: 0,
            required_total: 0,
            required_answered: 0,
            weighted_coverage: 0.0,
        };
        let mut total_weight = 0.0;
        let mut answered_weight = 0.0;

        for rule in &rules {
            let is_answered = answered.contains(rule.question_id.as_str());
            total_weight += rule.weight;
            if is_answered {
                progress.answered += 1;
                answered_weight += rule.weight;
            }
            if rule.required {
                progress.required_total += 1;
                if is_answered {
                    progress.required_answered += 1;
                }
            }
        }

        if total_weight > 0.0 {
            progress.weighted_coverage =
                ((answered_weight / total_weight) * 1000.0).round() / 10.0;
        }
        Ok(progress)
    }

    async fn load_answers(&self, subject_id: Uuid) -> Result<Vec<AnswerRecord>, EngineError> {
        self.ledger
            .answers(subject_id)
            .await
            .map_err(|e| EngineError::persistence(subject_id, e))
    }
}

fn answered_ids(answers: &[AnswerRecord]) -> HashSet<&str> {
    answers
        .iter()
        .filter(|a| a.is_answered())
        .map(|a| a.question_id.as_str())
        .collect()
}

fn answered_values(answers: &[AnswerRecord]) -> BTreeMap<String, serde_json::Value> {
    answers
        .iter()
        .filter(|a| a.is_answered())
        .filter_map(|a| a.value.clone().map(|v| (a.question_id.clone(), v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::rule;
    use crate::catalog::QuestionCatalog;
    use crate::inference::{DisabledInference, InferenceError};
    use crate::ledger::{AnswerSource, InMemoryLedger};
    use crate::observability::MemorySink;
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedInference(Vec<String>);

    #[async_trait]
    impl InferenceService for FixedInference {
        async fn relevant_questions(
            &self,
            _request: &InferenceRequest,
        ) -> Result<Vec<String>, InferenceError> {
            Ok(self.0.clone())
        }

        async fn suspect_answers(
            &self,
            _request: &InferenceRequest,
        ) -> Result<Vec<String>, InferenceError> {
            Ok(Vec::new())
        }
    }

    fn catalog() -> Arc<QuestionCatalog> {
        let mut rules: Vec<QuestionRule> = (0..5)
            .map(|i| rule(&format!("app_{:02}", i), "Application", "general", i))
            .collect();
        for r in rules.iter_mut().take(3) {
            r.required = true;
        }
        rules[4].weight = 3.0;
        Arc::new(QuestionCatalog::new(rules).unwrap())
    }

    fn service(
        ledger: Arc<InMemoryLedger>,
        inference: Arc<dyn InferenceService>,
        sink: Arc<MemorySink>,
    ) -> QuestionResolutionService {
        QuestionResolutionService::new(
            catalog(),
            ledger,
            inference,
            sink,
            Arc::new(FallbackCounters::default()),
            Deadline::after(Duration::from_secs(3)),
        )
    }

    async fn answer(ledger: &InMemoryLedger, subject_id: Uuid, ids: &[&str]) {
        for id in ids {
            ledger
                .upsert_answer(AnswerRecord::new(
                    subject_id,
                    *id,
                    json!("answered"),
                    AnswerSource::Human,
                    1.0,
                ))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_include_answered_returns_full_catalog() {
        let ledger = Arc::new(InMemoryLedger::new());
        let subject_id = Uuid::new_v4();
        answer(&ledger, subject_id, &["app_00"]).await;
        let svc = service(ledger, Arc::new(DisabledInference), Arc::new(MemorySink::new()));

        let set = svc
            .resolve(subject_id, "Application", true, false)
            .await
            .unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.status, ResolutionStatus::NotRequested);
    }

    #[tokio::test]
    async fn test_pruning_intersects_and_drops_invented_ids() {
        let ledger = Arc::new(InMemoryLedger::new());
        let subject_id = Uuid::new_v4();
        let inference = Arc::new(FixedInference(vec![
            "app_04".into(),
            "made_up".into(),
            "app_01".into(),
        ]));
        let svc = service(ledger, inference, Arc::new(MemorySink::new()));

        let set = svc
            .resolve(subject_id, "Application", false, true)
            .await
            .unwrap();
        assert_eq!(set.ids(), vec!["app_01", "app_04"]);
        assert_eq!(set.status, ResolutionStatus::Completed);
        assert!(!set.fallback_used);
    }

    #[tokio::test]
    async fn test_pruning_failure_falls_back_and_is_observed() {
        let ledger = Arc::new(InMemoryLedger::new());
        let sink = Arc::new(MemorySink::new());
        let svc = service(ledger, Arc::new(DisabledInference), sink.clone());

        let set = svc
            .resolve(Uuid::new_v4(), "Application", false, true)
            .await
            .unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.status, ResolutionStatus::Fallback);
        assert!(set.fallback_used);
        assert_eq!(sink.count(Operation::Prune, EventStatus::Fallback), 1);
        assert_eq!(svc.counters.snapshot().pruning, 1);
    }

    #[tokio::test]
    async fn test_nothing_left_skips_inference() {
        let ledger = Arc::new(InMemoryLedger::new());
        let subject_id = Uuid::new_v4();
        answer(
            &ledger,
            subject_id,
            &["app_00", "app_01", "app_02", "app_03", "app_04"],
        )
        .await;
        let sink = Arc::new(MemorySink::new());
        let svc = service(ledger, Arc::new(DisabledInference), sink.clone());

        let set = svc
            .resolve(subject_id, "Application", false, true)
            .await
            .unwrap();
        assert!(set.is_empty());
        assert_eq!(set.status, ResolutionStatus::Completed);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_progress_uses_weights_and_required_flags() {
        let ledger = Arc::new(InMemoryLedger::new());
        let subject_id = Uuid::new_v4();
        answer(&ledger, subject_id, &["app_00", "app_04"]).await;
        let svc = service(ledger, Arc::new(DisabledInference), Arc::new(MemorySink::new()));

        let progress = svc.progress(subject_id, "Application").await.unwrap();
        assert_eq!(progress.total, 5);
        assert_eq!(progress.answered, 2);
        assert_eq!(progress.required_total, 3);
        assert_eq!(progress.required_answered, 1);
        assert!(!progress.required_complete());
        // weights 1,1,1,1,3 -> answered 1 + 3 of 7
        assert_eq!(progress.weighted_coverage, 57.1);
    }

    #[tokio::test]
    async fn test_progress_for_unknown_type_is_zero() {
        let svc = service(
            Arc::new(InMemoryLedger::new()),
            Arc::new(DisabledInference),
            Arc::new(MemorySink::new()),
        );
        let progress = svc.progress(Uuid::new_v4(), "Mainframe").await.unwrap();
        assert_eq!(progress.total, 0);
        assert_eq!(progress.weighted_coverage, 0.0);
    }
}
