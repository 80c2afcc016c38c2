//! Engine error types
//!
//! Four caller-facing categories: invalid input, not found, an unavailable
//! external service and a persistence failure. Inference failures are
//! recovered locally and only show up here when a caller talks to the
//! inference client directly.

use thiserror::Error;
use uuid::Uuid;

use crate::inference::InferenceError;
use crate::ledger::LedgerError;

/// Main error type for the readiness engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("External service unavailable: {0}")]
    ExternalServiceUnavailable(#[from] InferenceError),

    #[error("Persistence failure for subject {subject_id}: {source}")]
    PersistenceFailure {
        subject_id: Uuid,
        #[source]
        source: LedgerError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn persistence(subject_id: Uuid, source: LedgerError) -> Self {
        Self::PersistenceFailure { subject_id, source }
    }

    /// Only a ledger batch that failed to commit is worth retrying as a whole
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure { .. })
    }
}

/// Validate a question id or field name: non-empty, `[A-Za-z0-9_.-]` only
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::invalid(format!("{} must not be empty", kind)));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(EngineError::invalid(format!(
            "{} '{}' contains unsupported characters",
            kind, value
        )));
    }
    Ok(())
}
