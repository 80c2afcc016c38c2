//! Adaptive data collection and phase readiness for onboarding flows
//!
//! - [`resolution`] works out which questions a subject still has to answer,
//!   optionally narrowed by an inference service with a hard deadline
//! - [`invalidation`] reopens answers when a field they depend on changes
//! - [`readiness`] and [`scoring`] decide whether a phase or flow may advance
//!
//! Storage, transport and the inference service itself are collaborators
//! behind traits ([`LedgerProvider`], [`InferenceService`],
//! [`ObservabilitySink`]).

pub mod catalog;
pub mod config;
pub mod dependency_map;
pub mod engine;
pub mod error;
pub mod inference;
pub mod invalidation;
pub mod ledger;
pub mod observability;
pub mod readiness;
pub mod resolution;
pub mod scoring;

pub use catalog::{AnswerKind, CatalogProvider, QuestionCatalog, QuestionRule};
pub use config::{DefinitionLoader, Definitions, EngineConfig};
pub use dependency_map::DependencyMap;
pub use engine::{ReadinessEngine, SubmissionOutcome};
pub use error::EngineError;
pub use inference::{
    Deadline, DisabledInference, HttpInferenceClient, InferenceError, InferenceRequest,
    InferenceService,
};
pub use invalidation::{DependencyInvalidationEngine, InvalidationOutcome, InvalidationTrigger};
pub use ledger::{
    same_value, AnswerRecord, AnswerSource, InMemoryLedger, InvalidationBatch,
    InvalidationEvent, LedgerError, LedgerProvider,
};
pub use observability::{
    EngineEvent, EventStatus, FallbackStats, MemorySink, ObservabilitySink, Operation,
    TracingSink,
};
pub use readiness::{
    ComparisonSense, CriterionKind, FlowSnapshot, FlowStatus, PhaseCatalog, PhaseDefinition,
    PhaseDefinitionProvider, PhaseReadinessValidator, ReadinessVerdict, VerdictReason,
};
pub use resolution::{
    QuestionResolutionService, QuestionSet, QuestionnaireProgress, ResolutionStatus,
    ResolveRequest,
};
pub use scoring::{aggregate, CompatibilityIssue, DecisionRecord};
