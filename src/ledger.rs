//! Answer Ledger
//!
//! Per-subject answers plus an append-only invalidation history. The storage
//! itself is an external collaborator behind [`LedgerProvider`]; the
//! in-memory implementation here backs tests and single-process embedding.
//!
//! Contract every implementation must honour:
//! - read-after-write consistency per subject
//! - `apply_batch` is all-or-nothing: either every clear and history append in
//!   the batch is visible, or none is

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Batch for subject {0} was rejected by storage")]
    BatchRejected(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Where an answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnswerSource {
    Human,
    Inference,
    Imported,
}

impl AnswerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Inference => "inference",
            Self::Imported => "imported",
        }
    }
}

impl std::fmt::Display for AnswerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stored answer keyed by (subject id, question id)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub subject_id: Uuid,
    pub question_id: String,
    /// `None` once the answer has been invalidated
    pub value: Option<serde_json::Value>,
    pub source: AnswerSource,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

impl AnswerRecord {
    pub fn new(
        subject_id: Uuid,
        question_id: impl Into<String>,
        value: serde_json::Value,
        source: AnswerSource,
        confidence: f64,
    ) -> Self {
        Self {
            subject_id,
            question_id: question_id.into(),
            value: Some(value),
            source,
            confidence,
            updated_at: Utc::now(),
        }
    }

    /// Answered means a value that is not null, blank text or an empty list
    pub fn is_answered(&self) -> bool {
        match &self.value {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }
}

/// Compare two answer values, treating numbers by value so `4` equals `4.0`
pub fn same_value(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_value(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| same_value(x, y)))
        }
        _ => a == b,
    }
}

/// Immutable history entry for one reopened question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub event_id: Uuid,
    pub subject_id: Uuid,
    pub question_id: String,
    pub reason: String,
    pub triggering_field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

/// Reopenings produced by a single field change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationBatch {
    /// Candidate question ids; unanswered ones are skipped
    pub question_ids: Vec<String>,
    pub reason: String,
    pub triggering_field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    /// Answer written in the same commit as the reopenings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upsert: Option<AnswerRecord>,
}

/// Storage collaborator for answers and invalidation history
#[async_trait]
pub trait LedgerProvider: Send + Sync {
    /// All answer records for a subject, including cleared ones
    async fn answers(&self, subject_id: Uuid) -> Result<Vec<AnswerRecord>, LedgerError>;

    /// Invalidation history in append order
    async fn history(&self, subject_id: Uuid) -> Result<Vec<InvalidationEvent>, LedgerError>;

    /// Insert or replace a single answer, returning the previous record
    async fn upsert_answer(
        &self,
        record: AnswerRecord,
    ) -> Result<Option<AnswerRecord>, LedgerError>;

    /// Atomically clear every answered id in the batch, append one history
    /// event per cleared id and write the batch's `upsert` record if any.
    /// Either all of it commits or none of it does. Returns the appended
    /// events.
    async fn apply_batch(
        &self,
        subject_id: Uuid,
        batch: &InvalidationBatch,
    ) -> Result<Vec<InvalidationEvent>, LedgerError>;
}

#[derive(Debug, Clone, Default)]
struct SubjectLedger {
    answers: HashMap<String, AnswerRecord>,
    history: Vec<InvalidationEvent>,
}

/// In-memory ledger
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    subjects: Arc<RwLock<HashMap<Uuid, SubjectLedger>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerProvider for InMemoryLedger {
    async fn answers(&self, subject_id: Uuid) -> Result<Vec<AnswerRecord>, LedgerError> {
        let subjects = self.subjects.read().await;
        let mut records: Vec<AnswerRecord> = subjects
            .get(&subject_id)
            .map(|s| s.answers.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.question_id.cmp(&b.question_id));
        Ok(records)
    }

    async fn history(&self, subject_id: Uuid) -> Result<Vec<InvalidationEvent>, LedgerError> {
        let subjects = self.subjects.read().await;
        Ok(subjects
            .get(&subject_id)
            .map(|s| s.history.clone())
            .unwrap_or_default())
    }

    async fn upsert_answer(
        &self,
        record: AnswerRecord,
    ) -> Result<Option<AnswerRecord>, LedgerError> {
        let mut subjects = self.subjects.write().await;
        let entry = subjects.entry(record.subject_id).or_default();
        Ok(entry.answers.insert(record.question_id.clone(), record))
    }

    async fn apply_batch(
        &self,
        subject_id: Uuid,
        batch: &InvalidationBatch,
    ) -> Result<Vec<InvalidationEvent>, LedgerError> {
        if let Some(record) = &batch.upsert {
            if record.subject_id != subject_id {
                return Err(LedgerError::BatchRejected(subject_id));
            }
        }

        let mut subjects = self.subjects.write().await;

        // Stage on a copy and swap in, so a failure part way leaves nothing behind
        let mut staged = subjects.get(&subject_id).cloned().unwrap_or_default();
        let now = Utc::now();
        let mut events = Vec::new();

        for question_id in &batch.question_ids {
            let Some(record) = staged.answers.get_mut(question_id) else {
                continue;
            };
            if !record.is_answered() {
                continue;
            }
            record.value = None;
            record.updated_at = now;

            let event = InvalidationEvent {
                event_id: Uuid::new_v4(),
                subject_id,
                question_id: question_id.clone(),
                reason: batch.reason.clone(),
                triggering_field: batch.triggering_field.clone(),
                old_value: batch.old_value.clone(),
                new_value: batch.new_value.clone(),
                occurred_at: now,
            };
            staged.history.push(event.clone());
            events.push(event);
        }

        if let Some(record) = &batch.upsert {
            staged
                .answers
                .insert(record.question_id.clone(), record.clone());
        }

        if !events.is_empty() || batch.upsert.is_some() {
            subjects.insert(subject_id, staged);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn batch(ids: &[&str]) -> InvalidationBatch {
        InvalidationBatch {
            question_ids: ids.iter().map(|s| s.to_string()).collect(),
            reason: "os_version changed".to_string(),
            triggering_field: "os_version".to_string(),
            old_value: Some(json!("RHEL 7")),
            new_value: Some(json!("RHEL 9")),
            upsert: None,
        }
    }

    #[test]
    fn test_is_answered() {
        let id = Uuid::new_v4();
        let mut record = AnswerRecord::new(id, "q", json!("yes"), AnswerSource::Human, 1.0);
        assert!(record.is_answered());
        record.value = Some(json!("  "));
        assert!(!record.is_answered());
        record.value = Some(json!([]));
        assert!(!record.is_answered());
        record.value = Some(json!(false));
        assert!(record.is_answered());
        record.value = None;
        assert!(!record.is_answered());
    }

    #[tokio::test]
    async fn test_upsert_returns_previous() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        let first = AnswerRecord::new(id, "q", json!("a"), AnswerSource::Human, 0.9);
        assert!(ledger.upsert_answer(first).await.unwrap().is_none());

        let second = AnswerRecord::new(id, "q", json!("b"), AnswerSource::Inference, 0.6);
        let previous = ledger.upsert_answer(second).await.unwrap().unwrap();
        assert_eq!(previous.value, Some(json!("a")));
        assert_eq!(ledger.answers(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch_clears_only_answered() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        for q in ["tech_stack", "supported_versions"] {
            ledger
                .upsert_answer(AnswerRecord::new(id, q, json!("x"), AnswerSource::Human, 1.0))
                .await
                .unwrap();
        }

        let events = ledger
            .apply_batch(id, &batch(&["tech_stack", "supported_versions", "patch_status"]))
            .await
            .unwrap();

        let ids: Vec<&str> = events.iter().map(|e| e.question_id.as_str()).collect();
        assert_eq!(ids, vec!["tech_stack", "supported_versions"]);
        assert!(ledger
            .answers(id)
            .await
            .unwrap()
            .iter()
            .all(|r| !r.is_answered()));
        assert_eq!(ledger.history(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_batch_on_cleared_answer_is_noop() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        ledger
            .upsert_answer(AnswerRecord::new(id, "tech_stack", json!("x"), AnswerSource::Human, 1.0))
            .await
            .unwrap();

        assert_eq!(ledger.apply_batch(id, &batch(&["tech_stack"])).await.unwrap().len(), 1);
        assert!(ledger.apply_batch(id, &batch(&["tech_stack"])).await.unwrap().is_empty());
        assert_eq!(ledger.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_empty() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        assert!(ledger.answers(id).await.unwrap().is_empty());
        assert!(ledger.apply_batch(id, &batch(&["q"])).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_batch_writes_upsert_in_same_commit() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        for (q, v) in [("os_version", "RHEL 7"), ("tech_stack", "java")] {
            ledger
                .upsert_answer(AnswerRecord::new(id, q, json!(v), AnswerSource::Human, 1.0))
                .await
                .unwrap();
        }

        let mut reopen = batch(&["tech_stack"]);
        reopen.upsert = Some(AnswerRecord::new(
            id,
            "os_version",
            json!("RHEL 9"),
            AnswerSource::Human,
            1.0,
        ));
        let events = ledger.apply_batch(id, &reopen).await.unwrap();
        assert_eq!(events.len(), 1);

        let answers = ledger.answers(id).await.unwrap();
        let os = answers.iter().find(|a| a.question_id == "os_version").unwrap();
        assert_eq!(os.value, Some(json!("RHEL 9")));
        let stack = answers.iter().find(|a| a.question_id == "tech_stack").unwrap();
        assert!(!stack.is_answered());
    }

    #[tokio::test]
    async fn test_apply_batch_rejects_upsert_for_other_subject() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        ledger
            .upsert_answer(AnswerRecord::new(id, "tech_stack", json!("x"), AnswerSource::Human, 1.0))
            .await
            .unwrap();

        let mut reopen = batch(&["tech_stack"]);
        reopen.upsert = Some(AnswerRecord::new(
            Uuid::new_v4(),
            "os_version",
            json!("RHEL 9"),
            AnswerSource::Human,
            1.0,
        ));
        assert!(matches!(
            ledger.apply_batch(id, &reopen).await,
            Err(LedgerError::BatchRejected(_))
        ));
        assert!(ledger.history(id).await.unwrap().is_empty());
        assert!(ledger.answers(id).await.unwrap()[0].is_answered());
    }

    #[test]
    fn test_same_value_compares_numbers_by_value() {
        assert!(same_value(&json!(4), &json!(4.0)));
        assert!(same_value(&json!([1, {"cores": 2}]), &json!([1.0, {"cores": 2.0}])));
        assert!(!same_value(&json!(4), &json!(4.5)));
        assert!(!same_value(&json!("4"), &json!(4)));
        assert!(!same_value(&json!([1]), &json!([1, 2])));
    }
}
