//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ob_readiness::{
    AnswerKind, AnswerRecord, AnswerSource, DefinitionLoader, Definitions, DependencyMap,
    EngineConfig, InMemoryLedger, InferenceError, InferenceRequest, InferenceService,
    InvalidationBatch, InvalidationEvent, LedgerError, LedgerProvider, MemorySink, PhaseCatalog,
    QuestionCatalog, QuestionRule, ReadinessEngine,
};
use uuid::Uuid;

/// Inference double with a scripted behaviour and a call counter
pub struct ScriptedInference {
    pub behaviour: Behaviour,
    pub calls: AtomicUsize,
}

pub enum Behaviour {
    /// Return these ids
    Answer(Vec<String>),
    /// Sleep longer than any deadline
    Hang,
    /// Fail immediately
    Fail,
}

impl ScriptedInference {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn respond(&self) -> Result<Vec<String>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            Behaviour::Answer(ids) => Ok(ids.clone()),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
            Behaviour::Fail => Err(InferenceError::Transport("connection refused".into())),
        }
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn relevant_questions(
        &self,
        _request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        self.respond().await
    }

    async fn suspect_answers(
        &self,
        _request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        self.respond().await
    }
}

fn rule(id: &str, subject_type: &str, order: u32, required: bool) -> QuestionRule {
    QuestionRule {
        question_id: id.to_string(),
        prompt: format!("Question {}", id),
        answer_kind: AnswerKind::Text,
        options: Vec::new(),
        subject_type: subject_type.to_string(),
        required,
        weight: 1.0,
        section: "general".to_string(),
        display_order: order,
        active: true,
    }
}

/// Five Application questions `app_00..app_04` (first three required) and
/// the three Server questions the os_version edge points at
pub fn scenario_definitions() -> Definitions {
    let mut rules: Vec<QuestionRule> = (0..5)
        .map(|i| rule(&format!("app_{:02}", i), "Application", i, i < 3))
        .collect();
    rules.push(rule("os_version", "Server", 0, true));
    rules.push(rule("tech_stack", "Server", 1, true));
    rules.push(rule("supported_versions", "Server", 2, false));
    rules.push(rule("patch_status", "Server", 3, false));

    Definitions {
        catalog: QuestionCatalog::new(rules).unwrap(),
        dependency_map: DependencyMap::new("test").with_edge(
            "os_version",
            ["tech_stack", "supported_versions", "patch_status"],
        ),
        phases: PhaseCatalog::default(),
    }
}

/// The definitions shipped under `config/definitions`
pub fn shipped_definitions() -> Definitions {
    let dir = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/definitions");
    DefinitionLoader::load_from_dir(&dir).unwrap()
}

pub fn engine_with(
    definitions: Definitions,
    ledger: Arc<dyn LedgerProvider>,
    inference: Arc<dyn InferenceService>,
    sink: Arc<MemorySink>,
) -> ReadinessEngine {
    ReadinessEngine::new(definitions, ledger, inference, sink, &EngineConfig::default())
}

pub async fn answer(ledger: &dyn LedgerProvider, subject_id: Uuid, ids: &[&str]) {
    for id in ids {
        ledger
            .upsert_answer(AnswerRecord::new(
                subject_id,
                *id,
                serde_json::json!(format!("answer for {}", id)),
                AnswerSource::Human,
                1.0,
            ))
            .await
            .unwrap();
    }
}

pub fn ledger() -> Arc<InMemoryLedger> {
    Arc::new(InMemoryLedger::new())
}

/// In-memory ledger whose writes can be switched to fail
#[derive(Default)]
pub struct FlakyLedger {
    pub inner: InMemoryLedger,
    pub fail_upsert: AtomicBool,
    pub fail_batch: AtomicBool,
}

impl FlakyLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failures(&self, upsert: bool, batch: bool) {
        self.fail_upsert.store(upsert, Ordering::SeqCst);
        self.fail_batch.store(batch, Ordering::SeqCst);
    }
}

#[async_trait]
impl LedgerProvider for FlakyLedger {
    async fn answers(&self, subject_id: Uuid) -> Result<Vec<AnswerRecord>, LedgerError> {
        self.inner.answers(subject_id).await
    }

    async fn history(&self, subject_id: Uuid) -> Result<Vec<InvalidationEvent>, LedgerError> {
        self.inner.history(subject_id).await
    }

    async fn upsert_answer(
        &self,
        record: AnswerRecord,
    ) -> Result<Option<AnswerRecord>, LedgerError> {
        if self.fail_upsert.load(Ordering::SeqCst) {
            return Err(LedgerError::Storage("upsert unavailable".into()));
        }
        self.inner.upsert_answer(record).await
    }

    async fn apply_batch(
        &self,
        subject_id: Uuid,
        batch: &InvalidationBatch,
    ) -> Result<Vec<InvalidationEvent>, LedgerError> {
        if self.fail_batch.load(Ordering::SeqCst) {
            return Err(LedgerError::BatchRejected(subject_id));
        }
        self.inner.apply_batch(subject_id, batch).await
    }
}
