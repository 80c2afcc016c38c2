//! Readiness Engine
//!
//! Facade wiring catalog, dependency map, ledger, inference and phase
//! definitions into the three request paths: question resolution, dependency
//! invalidation and phase readiness.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::CatalogProvider;
use crate::config::{DefinitionLoader, Definitions, EngineConfig};
use crate::dependency_map::DependencyMap;
use crate::error::{validate_identifier, EngineError};
use crate::inference::{Deadline, DisabledInference, HttpInferenceClient, InferenceService};
use crate::invalidation::{DependencyInvalidationEngine, InvalidationOutcome};
use crate::ledger::{same_value, AnswerRecord, AnswerSource, InvalidationEvent, LedgerProvider};
use crate::observability::{FallbackCounters, FallbackStats, ObservabilitySink, TracingSink};
use crate::readiness::{FlowSnapshot, FlowStatus, PhaseReadinessValidator, ReadinessVerdict};
use crate::resolution::{
    QuestionResolutionService, QuestionSet, QuestionnaireProgress, ResolveRequest,
};
use crate::scoring::{self, DecisionRecord};

/// Result of recording an answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionOutcome {
    pub record: AnswerRecord,
    pub previous_value: Option<serde_json::Value>,
    /// Present when the answer changed a volatile field
    pub invalidation: Option<InvalidationOutcome>,
}

pub struct ReadinessEngine {
    catalog: Arc<dyn CatalogProvider>,
    ledger: Arc<dyn LedgerProvider>,
    resolution: QuestionResolutionService,
    invalidation: DependencyInvalidationEngine,
    validator: PhaseReadinessValidator,
    counters: Arc<FallbackCounters>,
}

impl ReadinessEngine {
    pub fn new(
        definitions: Definitions,
        ledger: Arc<dyn LedgerProvider>,
        inference: Arc<dyn InferenceService>,
        sink: Arc<dyn ObservabilitySink>,
        config: &EngineConfig,
    ) -> Self {
        let catalog: Arc<dyn CatalogProvider> = Arc::new(definitions.catalog);
        let counters = Arc::new(FallbackCounters::default());
        let deadline = Deadline::after(config.inference_deadline);

        Self {
            resolution: QuestionResolutionService::new(
                catalog.clone(),
                ledger.clone(),
                inference.clone(),
                sink.clone(),
                counters.clone(),
                deadline,
            ),
            invalidation: DependencyInvalidationEngine::new(
                Arc::new(definitions.dependency_map),
                ledger.clone(),
                inference,
                sink.clone(),
                counters.clone(),
                deadline,
            ),
            validator: PhaseReadinessValidator::new(Arc::new(definitions.phases), sink),
            catalog,
            ledger,
            counters,
        }
    }

    /// Build from configuration: definitions from `definitions_dir`, HTTP
    /// inference when `inference_url` is set, `tracing` for events
    pub fn from_config(
        config: &EngineConfig,
        ledger: Arc<dyn LedgerProvider>,
    ) -> Result<Self, EngineError> {
        let dir = config
            .definitions_dir
            .as_deref()
            .ok_or_else(|| EngineError::Config("READINESS_DEFINITIONS_DIR is not set".into()))?;
        let definitions = DefinitionLoader::load_from_dir(Path::new(dir))?;

        let inference: Arc<dyn InferenceService> = match &config.inference_url {
            Some(url) => {
                info!(%url, deadline_ms = config.inference_deadline.as_millis() as u64, "inference enabled");
                Arc::new(HttpInferenceClient::new(url.as_str(), config.inference_deadline)?)
            }
            None => {
                info!("no inference endpoint configured, pruning and dependency inference will fall back");
                Arc::new(DisabledInference)
            }
        };

        Ok(Self::new(
            definitions,
            ledger,
            inference,
            Arc::new(TracingSink),
            config,
        ))
    }

    pub fn dependency_map(&self) -> &DependencyMap {
        self.invalidation.dependency_map()
    }

    // ---------------------------------------------------------------------
    // Questions
    // ---------------------------------------------------------------------

    pub async fn resolve(
        &self,
        subject_id: Uuid,
        subject_type: &str,
        include_answered: bool,
        allow_pruning: bool,
    ) -> Result<QuestionSet, EngineError> {
        self.resolution
            .resolve(subject_id, subject_type, include_answered, allow_pruning)
            .await
    }

    pub async fn resolve_with(&self, request: ResolveRequest) -> Result<QuestionSet, EngineError> {
        self.resolution.resolve_with(request).await
    }

    pub async fn progress(
        &self,
        subject_id: Uuid,
        subject_type: &str,
    ) -> Result<QuestionnaireProgress, EngineError> {
        self.resolution.progress(subject_id, subject_type).await
    }

    /// Record an answer.
    ///
    /// When the question is itself a volatile field and a previous answer
    /// differs, its dependents are reopened in the same ledger commit as the
    /// new answer, so a failed submission writes nothing and can be retried.
    pub async fn submit_answer(
        &self,
        subject_id: Uuid,
        subject_type: &str,
        question_id: &str,
        value: serde_json::Value,
        source: AnswerSource,
        confidence: f64,
    ) -> Result<SubmissionOutcome, EngineError> {
        validate_identifier("question id", question_id)?;
        if subject_type.trim().is_empty() {
            return Err(EngineError::invalid("subject type must not be empty"));
        }
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EngineError::invalid(format!(
                "confidence {} is outside 0..=1",
                confidence
            )));
        }
        let rule = self
            .catalog
            .rule(subject_type, question_id)
            .ok_or_else(|| {
                EngineError::not_found("question", format!("{}/{}", subject_type, question_id))
            })?;
        rule.check_value(&value)?;

        let previous_value = self
            .ledger
            .answers(subject_id)
            .await
            .map_err(|e| EngineError::persistence(subject_id, e))?
            .into_iter()
            .find(|a| a.question_id == question_id && a.is_answered())
            .and_then(|a| a.value);

        let changed = previous_value
            .as_ref()
            .is_some_and(|old| !same_value(old, &value));
        let record = AnswerRecord::new(subject_id, question_id, value, source, confidence);

        let invalidation = if changed && self.dependency_map().is_volatile(question_id) {
            debug!(%subject_id, question_id, "resubmission changed a volatile field");
            Some(
                self.invalidation
                    .reopen_with_answer(record.clone(), previous_value.clone())
                    .await?,
            )
        } else {
            self.ledger
                .upsert_answer(record.clone())
                .await
                .map_err(|e| EngineError::persistence(subject_id, e))?;
            None
        };

        Ok(SubmissionOutcome {
            record,
            previous_value,
            invalidation,
        })
    }

    // ---------------------------------------------------------------------
    // Invalidation
    // ---------------------------------------------------------------------

    pub async fn on_field_changed(
        &self,
        subject_id: Uuid,
        field_name: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Result<InvalidationOutcome, EngineError> {
        self.invalidation
            .on_field_changed(subject_id, field_name, old_value, new_value)
            .await
    }

    pub async fn on_field_changed_with_timeout(
        &self,
        subject_id: Uuid,
        field_name: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<InvalidationOutcome, EngineError> {
        self.invalidation
            .on_field_changed_with_timeout(subject_id, field_name, old_value, new_value, Some(timeout))
            .await
    }

    /// Invalidation history for a subject, oldest first
    pub async fn history(&self, subject_id: Uuid) -> Result<Vec<InvalidationEvent>, EngineError> {
        self.ledger
            .history(subject_id)
            .await
            .map_err(|e| EngineError::persistence(subject_id, e))
    }

    // ---------------------------------------------------------------------
    // Readiness
    // ---------------------------------------------------------------------

    pub fn validate_phase(
        &self,
        phase_name: &str,
        snapshot: &FlowSnapshot,
    ) -> Result<ReadinessVerdict, EngineError> {
        self.validator.validate_phase(phase_name, snapshot)
    }

    pub fn overall_status(&self, snapshot: &FlowSnapshot) -> Result<FlowStatus, EngineError> {
        self.validator.overall_status(snapshot)
    }

    pub fn aggregate(decisions: &BTreeMap<Uuid, DecisionRecord>) -> f64 {
        scoring::aggregate(decisions)
    }

    pub fn fallback_stats(&self) -> FallbackStats {
        self.counters.snapshot()
    }
}
