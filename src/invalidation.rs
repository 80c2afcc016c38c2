//! Dependency Invalidation
//!
//! When a volatile field changes, answers that depended on it are reopened:
//! the value is cleared and one history event is appended per reopened
//! question, all in a single ledger batch.
//!
//! Fields listed in the dependency map are handled deterministically. Any
//! other field goes to the inference service; without a confident answer in
//! time nothing is reopened.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dependency_map::DependencyMap;
use crate::error::{validate_identifier, EngineError};
use crate::inference::{Deadline, FieldChange, InferenceRequest, InferenceService, SubjectSnapshot};
use crate::ledger::{same_value, AnswerRecord, InvalidationBatch, InvalidationEvent, LedgerProvider};
use crate::observability::{
    EngineEvent, EventStatus, FallbackCounters, ObservabilitySink, Operation,
};

/// Which path decided the reopened set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationTrigger {
    DependencyMap,
    Inference,
    /// Inference failed or timed out; nothing reopened
    InferenceFallback,
    /// Unmapped field on a subject with no answers; inference was not called
    NoAnswers,
    /// Old and new values are equal
    Unchanged,
}

/// Result of one field change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidationOutcome {
    pub subject_id: Uuid,
    pub field: String,
    pub reopened: Vec<String>,
    pub reason: String,
    pub affected_subjects: Vec<Uuid>,
    pub trigger: InvalidationTrigger,
    pub events: Vec<InvalidationEvent>,
}

impl InvalidationOutcome {
    fn empty(subject_id: Uuid, field: &str, reason: String, trigger: InvalidationTrigger) -> Self {
        Self {
            subject_id,
            field: field.to_string(),
            reopened: Vec::new(),
            reason,
            affected_subjects: Vec::new(),
            trigger,
            events: Vec::new(),
        }
    }
}

pub struct DependencyInvalidationEngine {
    dependency_map: Arc<DependencyMap>,
    ledger: Arc<dyn LedgerProvider>,
    inference: Arc<dyn InferenceService>,
    sink: Arc<dyn ObservabilitySink>,
    counters: Arc<FallbackCounters>,
    deadline: Deadline,
}

impl DependencyInvalidationEngine {
    pub fn new(
        dependency_map: Arc<DependencyMap>,
        ledger: Arc<dyn LedgerProvider>,
        inference: Arc<dyn InferenceService>,
        sink: Arc<dyn ObservabilitySink>,
        counters: Arc<FallbackCounters>,
        deadline: Deadline,
    ) -> Self {
        Self {
            dependency_map,
            ledger,
            inference,
            sink,
            counters,
            deadline,
        }
    }

    pub fn dependency_map(&self) -> &DependencyMap {
        &self.dependency_map
    }

    pub async fn on_field_changed(
        &self,
        subject_id: Uuid,
        field_name: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Result<InvalidationOutcome, EngineError> {
        self.on_field_changed_with_timeout(subject_id, field_name, old_value, new_value, None)
            .await
    }

    /// As [`Self::on_field_changed`], with a caller budget for the inference
    /// step that applies only when shorter than the configured deadline
    pub async fn on_field_changed_with_timeout(
        &self,
        subject_id: Uuid,
        field_name: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<InvalidationOutcome, EngineError> {
        self.reopen(subject_id, field_name, old_value, new_value, timeout, None)
            .await
    }

    /// Reopen the dependents of a changed volatile answer and write the new
    /// answer in the same ledger commit. A failed commit writes nothing.
    pub async fn reopen_with_answer(
        &self,
        record: AnswerRecord,
        old_value: Option<serde_json::Value>,
    ) -> Result<InvalidationOutcome, EngineError> {
        let field = record.question_id.clone();
        let new_value = record.value.clone();
        self.reopen(record.subject_id, &field, old_value, new_value, None, Some(record))
            .await
    }

    async fn reopen(
        &self,
        subject_id: Uuid,
        field_name: &str,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
        timeout: Option<Duration>,
        upsert: Option<AnswerRecord>,
    ) -> Result<InvalidationOutcome, EngineError> {
        validate_identifier("field name", field_name)?;

        if upsert.is_none() && unchanged(old_value.as_ref(), new_value.as_ref()) {
            debug!(%subject_id, field = field_name, "field value unchanged, nothing to reopen");
            return Ok(InvalidationOutcome::empty(
                subject_id,
                field_name,
                format!("'{}' unchanged", field_name),
                InvalidationTrigger::Unchanged,
            ));
        }

        let change = FieldChange {
            field: field_name.to_string(),
            old_value,
            new_value,
        };

        let (candidates, trigger) = match self.dependency_map.dependents(field_name) {
            Some(dependents) => (dependents.to_vec(), InvalidationTrigger::DependencyMap),
            None => {
                self.infer_suspects(subject_id, &change, self.deadline.tightened(timeout))
                    .await?
            }
        };

        let reason = match trigger {
            InvalidationTrigger::DependencyMap => format!(
                "'{}' changed (dependency map v{})",
                field_name, self.dependency_map.version
            ),
            InvalidationTrigger::Inference => {
                format!("'{}' changed (flagged by inference)", field_name)
            }
            _ => format!("'{}' changed", field_name),
        };

        if candidates.is_empty() && upsert.is_none() {
            return Ok(InvalidationOutcome::empty(subject_id, field_name, reason, trigger));
        }

        let batch = InvalidationBatch {
            question_ids: candidates,
            reason: reason.clone(),
            triggering_field: change.field.clone(),
            old_value: change.old_value,
            new_value: change.new_value,
            upsert,
        };

        let events = self.commit(subject_id, &batch).await?;
        let reopened: Vec<String> = events.iter().map(|e| e.question_id.clone()).collect();
        let affected_subjects = if reopened.is_empty() {
            Vec::new()
        } else {
            vec![subject_id]
        };

        Ok(InvalidationOutcome {
            subject_id,
            field: field_name.to_string(),
            reopened,
            reason,
            affected_subjects,
            trigger,
            events,
        })
    }

    /// Ask the inference service which current answers the change makes
    /// suspect. Failures resolve to the empty set.
    async fn infer_suspects(
        &self,
        subject_id: Uuid,
        change: &FieldChange,
        deadline: Deadline,
    ) -> Result<(Vec<String>, InvalidationTrigger), EngineError> {
        let answers = self
            .ledger
            .answers(subject_id)
            .await
            .map_err(|e| EngineError::persistence(subject_id, e))?;

        let answered: Vec<_> = answers.into_iter().filter(|a| a.is_answered()).collect();
        if answered.is_empty() {
            debug!(%subject_id, field = %change.field, "no answers to reopen, inference not called");
            return Ok((Vec::new(), InvalidationTrigger::NoAnswers));
        }

        let request = InferenceRequest {
            subject: SubjectSnapshot {
                subject_id,
                subject_type: None,
                answers: answered
                    .iter()
                    .filter_map(|a| a.value.clone().map(|v| (a.question_id.clone(), v)))
                    .collect(),
            },
            candidate_ids: answered.iter().map(|a| a.question_id.clone()).collect(),
            change: Some(change.clone()),
            deadline_ms: deadline.budget().as_millis() as u64,
        };

        let started = Instant::now();
        match deadline.run(self.inference.suspect_answers(&request)).await {
            Ok(suspects) => {
                let suspects: HashSet<&str> = suspects.iter().map(String::as_str).collect();
                let ids = request
                    .candidate_ids
                    .iter()
                    .filter(|id| suspects.contains(id.as_str()))
                    .cloned()
                    .collect();
                Ok((ids, InvalidationTrigger::Inference))
            }
            Err(e) => {
                warn!(
                    %subject_id,
                    field = %change.field,
                    error = %e,
                    "dependency inference failed, reopening nothing"
                );
                self.counters.record(Operation::DependencyInference);
                self.sink.emit(EngineEvent::new(
                    Some(subject_id),
                    Operation::DependencyInference,
                    EventStatus::Fallback,
                    started.elapsed(),
                    e.to_string(),
                ));
                Ok((Vec::new(), InvalidationTrigger::InferenceFallback))
            }
        }
    }

    async fn commit(
        &self,
        subject_id: Uuid,
        batch: &InvalidationBatch,
    ) -> Result<Vec<InvalidationEvent>, EngineError> {
        let started = Instant::now();
        match self.ledger.apply_batch(subject_id, batch).await {
            Ok(events) => {
                info!(
                    %subject_id,
                    field = %batch.triggering_field,
                    candidates = batch.question_ids.len(),
                    reopened = events.len(),
                    "invalidation batch committed"
                );
                self.sink.emit(EngineEvent::new(
                    Some(subject_id),
                    Operation::InvalidationBatch,
                    EventStatus::Committed,
                    started.elapsed(),
                    format!("{} reopened by '{}'", events.len(), batch.triggering_field),
                ));
                Ok(events)
            }
            Err(e) => {
                self.sink.emit(EngineEvent::new(
                    Some(subject_id),
                    Operation::InvalidationBatch,
                    EventStatus::Failed,
                    started.elapsed(),
                    e.to_string(),
                ));
                Err(EngineError::persistence(subject_id, e))
            }
        }
    }
}

fn unchanged(old: Option<&serde_json::Value>, new: Option<&serde_json::Value>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => same_value(old, new),
        (None, None) => true,
        _ => false,
    }
}
