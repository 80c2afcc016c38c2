//! Dependency Map
//!
//! Versioned table of volatile field name -> dependent question ids. Injected
//! at construction so different tenants or catalog versions can carry their
//! own graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::catalog::CatalogProvider;
use crate::error::{validate_identifier, EngineError};

/// A versioned dependency graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyMap {
    #[serde(default = "default_version")]
    pub version: String,
    /// Volatile field -> ordered dependent question ids
    #[serde(default)]
    pub edges: BTreeMap<String, Vec<String>>,
}

fn default_version() -> String {
    "1".to_string()
}

impl DependencyMap {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            edges: BTreeMap::new(),
        }
    }

    /// Builder-style edge registration
    pub fn with_edge<I, S>(mut self, field: impl Into<String>, dependents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges.insert(
            field.into(),
            dependents.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Dependent question ids for a field, `None` when the field is not volatile
    pub fn dependents(&self, field: &str) -> Option<&[String]> {
        self.edges.get(field).map(Vec::as_slice)
    }

    pub fn is_volatile(&self, field: &str) -> bool {
        self.edges.contains_key(field)
    }

    /// Check every referenced id exists in the catalog and no edge lists an
    /// id twice
    pub fn validate(&self, catalog: &dyn CatalogProvider) -> Result<(), EngineError> {
        for (field, dependents) in &self.edges {
            validate_identifier("volatile field", field)?;
            let mut seen = std::collections::HashSet::new();
            for id in dependents {
                if !catalog.contains(id) {
                    return Err(EngineError::invalid(format!(
                        "dependency map v{} references unknown question '{}' from field '{}'",
                        self.version, id, field
                    )));
                }
                if !seen.insert(id.as_str()) {
                    return Err(EngineError::invalid(format!(
                        "field '{}' lists question '{}' more than once",
                        field, id
                    )));
                }
            }
        }
        Ok(())
    }
}
