//! Question Catalog
//!
//! Static question rules scoped to a subject type. Rules are immutable at
//! runtime; activation and deactivation happen out of band by reloading the
//! catalog.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{validate_identifier, EngineError};

/// Kind of answer a question expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    Text,
    Select,
    Multiselect,
    File,
    Boolean,
    Numeric,
}

impl AnswerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Select => "select",
            Self::Multiselect => "multiselect",
            Self::File => "file",
            Self::Boolean => "boolean",
            Self::Numeric => "numeric",
        }
    }

    /// Check the JSON shape of a submitted value against this kind
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        use serde_json::Value;
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Text | Self::Select | Self::File, Value::String(_)) => true,
            (Self::Multiselect, Value::Array(items)) => items.iter().all(Value::is_string),
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Numeric, Value::Number(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AnswerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single question rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRule {
    pub question_id: String,
    pub prompt: String,
    pub answer_kind: AnswerKind,
    #[serde(default)]
    pub options: Vec<String>,
    /// Owning subject type (e.g. "Application", "Server")
    pub subject_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub display_order: u32,
    /// Inactive rules stay in the catalog file but are never served
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_active() -> bool {
    true
}

impl QuestionRule {
    /// Validate the values of a submitted answer against this rule
    pub fn check_value(&self, value: &serde_json::Value) -> Result<(), EngineError> {
        if !self.answer_kind.accepts(value) {
            return Err(EngineError::invalid(format!(
                "question '{}' expects a {} answer",
                self.question_id, self.answer_kind
            )));
        }
        if self.options.is_empty() {
            return Ok(());
        }
        let chosen: Vec<&str> = match value {
            serde_json::Value::String(s) if self.answer_kind == AnswerKind::Select => {
                vec![s.as_str()]
            }
            serde_json::Value::Array(items) => items.iter().filter_map(|v| v.as_str()).collect(),
            _ => Vec::new(),
        };
        if let Some(bad) = chosen.iter().find(|c| !self.options.iter().any(|o| o == *c)) {
            return Err(EngineError::invalid(format!(
                "'{}' is not an option of question '{}'",
                bad, self.question_id
            )));
        }
        Ok(())
    }
}

/// Read access to question rules
///
/// Total: an unknown subject type yields an empty list, never an error.
pub trait CatalogProvider: Send + Sync {
    /// Active rules for a subject type ordered by section then display order
    fn rules(&self, subject_type: &str) -> Vec<QuestionRule>;

    /// Look up a single active rule
    fn rule(&self, subject_type: &str, question_id: &str) -> Option<QuestionRule> {
        self.rules(subject_type)
            .into_iter()
            .find(|r| r.question_id == question_id)
    }

    /// Whether any rule (for any subject type) carries this id
    fn contains(&self, question_id: &str) -> bool;
}

/// In-memory catalog built from a validated rule list
#[derive(Debug, Clone, Default)]
pub struct QuestionCatalog {
    by_type: HashMap<String, Vec<QuestionRule>>,
    ids: HashSet<String>,
}

impl QuestionCatalog {
    /// Build a catalog, rejecting duplicate ids and malformed rules
    pub fn new(rules: Vec<QuestionRule>) -> Result<Self, EngineError> {
        let mut by_type: HashMap<String, Vec<QuestionRule>> = HashMap::new();
        let mut ids = HashSet::new();

        for rule in rules {
            validate_identifier("question id", &rule.question_id)?;
            if rule.subject_type.trim().is_empty() {
                return Err(EngineError::invalid(format!(
                    "question '{}' has no subject type",
                    rule.question_id
                )));
            }
            if rule.prompt.trim().is_empty() {
                return Err(EngineError::invalid(format!(
                    "question '{}' has an empty prompt",
                    rule.question_id
                )));
            }
            if !rule.weight.is_finite() || rule.weight < 0.0 {
                return Err(EngineError::invalid(format!(
                    "question '{}' has invalid weight {}",
                    rule.question_id, rule.weight
                )));
            }
            if matches!(rule.answer_kind, AnswerKind::Select | AnswerKind::Multiselect)
                && rule.options.is_empty()
            {
                return Err(EngineError::invalid(format!(
                    "question '{}' is a {} without options",
                    rule.question_id, rule.answer_kind
                )));
            }
            if !ids.insert(rule.question_id.clone()) {
                return Err(EngineError::invalid(format!(
                    "duplicate question id '{}'",
                    rule.question_id
                )));
            }
            by_type
                .entry(rule.subject_type.clone())
                .or_default()
                .push(rule);
        }

        for rules in by_type.values_mut() {
            rules.sort_by(|a, b| {
                a.section
                    .cmp(&b.section)
                    .then(a.display_order.cmp(&b.display_order))
                    .then(a.question_id.cmp(&b.question_id))
            });
        }

        Ok(Self { by_type, ids })
    }

    pub fn subject_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl CatalogProvider for QuestionCatalog {
    fn rules(&self, subject_type: &str) -> Vec<QuestionRule> {
        let subject_type = subject_type.trim();
        if subject_type.is_empty() {
            return Vec::new();
        }
        self.by_type
            .get(subject_type)
            .map(|rules| rules.iter().filter(|r| r.active).cloned().collect())
            .unwrap_or_default()
    }

    fn contains(&self, question_id: &str) -> bool {
        self.ids.contains(question_id)
    }
}
