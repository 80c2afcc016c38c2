//! Inference Service Integration
//!
//! The inference service is unreliable by assumption. Every call goes through
//! [`Deadline::run`], which cancels the in-flight future when the budget runs
//! out; callers then apply their own fallback.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Error type for inference calls
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("inference call exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("inference service not configured")]
    NotConfigured,
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Transport(format!("request timed out: {}", e))
        } else if e.is_decode() {
            Self::InvalidResponse(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Time budget for one inference call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// A caller-supplied timeout wins only when it is shorter
    pub fn tightened(self, caller: Option<Duration>) -> Self {
        match caller {
            Some(c) if c < self.budget => Self { budget: c },
            _ => self,
        }
    }

    /// Run the call, dropping it once the budget is spent
    pub async fn run<T, F>(self, call: F) -> Result<T, InferenceError>
    where
        F: Future<Output = Result<T, InferenceError>>,
    {
        match tokio::time::timeout(self.budget, call).await {
            Ok(result) => result,
            Err(_) => Err(InferenceError::Timeout(self.budget)),
        }
    }
}

/// What the inference service knows about a subject
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectSnapshot {
    pub subject_id: Uuid,
    #[serde(default)]
    pub subject_type: Option<String>,
    /// Answered question id -> value
    #[serde(default)]
    pub answers: BTreeMap<String, serde_json::Value>,
}

/// A field change shipped with dependency inference requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// Request body for both pruning and dependency inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub subject: SubjectSnapshot,
    pub candidate_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<FieldChange>,
    /// Budget the service should respect; the engine enforces it regardless
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct InferenceResponse {
    question_ids: Vec<String>,
}

/// External inference collaborator
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Which candidate questions remain relevant for the subject
    async fn relevant_questions(
        &self,
        request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError>;

    /// Which answered questions are suspect after the field change
    async fn suspect_answers(
        &self,
        request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError>;
}

/// Stand-in used when no inference endpoint is configured; every call fails
/// fast so callers take their fallback path.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledInference;

#[async_trait]
impl InferenceService for DisabledInference {
    async fn relevant_questions(
        &self,
        _request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        Err(InferenceError::NotConfigured)
    }

    async fn suspect_answers(
        &self,
        _request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        Err(InferenceError::NotConfigured)
    }
}

/// JSON-over-HTTP inference client
///
/// Posts [`InferenceRequest`] to `{base_url}/prune` and `{base_url}/suspect`
/// and expects `{"question_ids": [...]}` back.
pub struct HttpInferenceClient {
    client: Client,
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, request: &InferenceRequest) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, candidates = request.candidate_ids.len(), "calling inference service");

        let response = self.client.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            return Err(InferenceError::Transport(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: InferenceResponse = response.json().await?;
        Ok(body.question_ids)
    }
}

#[async_trait]
impl InferenceService for HttpInferenceClient {
    async fn relevant_questions(
        &self,
        request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        self.post("prune", request).await
    }

    async fn suspect_answers(
        &self,
        request: &InferenceRequest,
    ) -> Result<Vec<String>, InferenceError> {
        self.post("suspect", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_timeout_only_tightens() {
        let deadline = Deadline::after(Duration::from_secs(3));
        assert_eq!(
            deadline.tightened(Some(Duration::from_millis(500))).budget(),
            Duration::from_millis(500)
        );
        assert_eq!(
            deadline.tightened(Some(Duration::from_secs(10))).budget(),
            Duration::from_secs(3)
        );
        assert_eq!(deadline.tightened(None).budget(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let deadline = Deadline::after(Duration::from_millis(100));
        let result: Result<(), _> = deadline
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(InferenceError::Timeout(d)) if d == Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let deadline = Deadline::after(Duration::from_secs(1));
        let ids = deadline
            .run(async { Ok(vec!["a".to_string()]) })
            .await
            .unwrap();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_disabled_inference_fails_fast() {
        let request = InferenceRequest {
            subject: SubjectSnapshot::default(),
            candidate_ids: vec![],
            change: None,
            deadline_ms: 10,
        };
        assert!(matches!(
            DisabledInference.relevant_questions(&request).await,
            Err(InferenceError::NotConfigured)
        ));
    }

    #[test]
    fn test_request_serialization_omits_missing_change() {
        let request = InferenceRequest {
            subject: SubjectSnapshot::default(),
            candidate_ids: vec!["app_03".into()],
            change: None,
            deadline_ms: 3000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("change").is_none());
        assert_eq!(json["candidate_ids"][0], "app_03");
    }
}
