//! Configuration and Definition Loading
//!
//! Runtime knobs come from the environment (after `.env` is loaded);
//! question catalogs, dependency maps and phases come from YAML files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::catalog::{QuestionCatalog, QuestionRule};
use crate::dependency_map::DependencyMap;
use crate::error::EngineError;
use crate::readiness::{PhaseCatalog, PhaseDefinition, PhaseDefinitionProvider};

pub const DEFAULT_INFERENCE_DEADLINE_MS: u64 = 3_000;

/// Engine runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Budget for every inference call
    pub inference_deadline: Duration,
    /// Base URL of the inference service; `None` disables inference
    pub inference_url: Option<String>,
    /// Directory holding definition YAML files
    pub definitions_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inference_deadline: Duration::from_millis(DEFAULT_INFERENCE_DEADLINE_MS),
            inference_url: None,
            definitions_dir: None,
        }
    }
}

impl EngineConfig {
    /// Read `READINESS_INFERENCE_DEADLINE_MS`, `READINESS_INFERENCE_URL` and
    /// `READINESS_DEFINITIONS_DIR`, loading `.env` first if present
    pub fn from_env() -> Result<Self, EngineError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("READINESS_INFERENCE_DEADLINE_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!(
                    "READINESS_INFERENCE_DEADLINE_MS must be a positive integer, got '{}'",
                    raw
                ))
            })?;
            if ms == 0 {
                return Err(EngineError::Config(
                    "READINESS_INFERENCE_DEADLINE_MS must be greater than zero".to_string(),
                ));
            }
            config.inference_deadline = Duration::from_millis(ms);
        }
        config.inference_url = lookup("READINESS_INFERENCE_URL").filter(|s| !s.trim().is_empty());
        config.definitions_dir =
            lookup("READINESS_DEFINITIONS_DIR").filter(|s| !s.trim().is_empty());

        Ok(config)
    }
}

/// Definition bundle as it appears on disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionFile {
    #[serde(default)]
    pub questions: Vec<QuestionRule>,
    #[serde(default)]
    pub dependency_map: Option<DependencyMap>,
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
}

/// Validated definitions ready to build an engine from
#[derive(Debug, Clone)]
pub struct Definitions {
    pub catalog: QuestionCatalog,
    pub dependency_map: DependencyMap,
    pub phases: PhaseCatalog,
}

impl Definitions {
    /// Validate a raw bundle: catalog ids, dependency references, phase ordinals
    pub fn from_file(file: DefinitionFile) -> Result<Self, EngineError> {
        let catalog = QuestionCatalog::new(file.questions)?;
        let dependency_map = file.dependency_map.unwrap_or_default();
        dependency_map.validate(&catalog)?;
        let phases = PhaseCatalog::new(file.phases)?;
        Ok(Self {
            catalog,
            dependency_map,
            phases,
        })
    }
}

/// Loader for definition bundles
pub struct DefinitionLoader;

impl DefinitionLoader {
    /// Merge every `.yaml`/`.yml` file in a directory into one bundle.
    /// Only one file may carry a dependency map.
    pub fn load_from_dir(dir: &Path) -> Result<Definitions, EngineError> {
        if !dir.is_dir() {
            return Err(EngineError::not_found(
                "definitions directory",
                dir.display().to_string(),
            ));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .map(|e| e == "yaml" || e == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut merged = DefinitionFile::default();
        for path in &paths {
            let content = std::fs::read_to_string(path)?;
            let file: DefinitionFile = serde_yaml::from_str(&content)?;
            merged.questions.extend(file.questions);
            merged.phases.extend(file.phases);
            if let Some(map) = file.dependency_map {
                if merged.dependency_map.is_some() {
                    return Err(EngineError::Config(format!(
                        "second dependency map found in {}",
                        path.display()
                    )));
                }
                merged.dependency_map = Some(map);
            }
        }

        let definitions = Definitions::from_file(merged)?;
        info!(
            dir = %dir.display(),
            files = paths.len(),
            questions = definitions.catalog.len(),
            phases = definitions.phases.phases().len(),
            dependency_map_version = %definitions.dependency_map.version,
            "definitions loaded"
        );
        Ok(definitions)
    }

    pub fn load_from_file(path: &Path) -> Result<Definitions, EngineError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(yaml: &str) -> Result<Definitions, EngineError> {
        let file: DefinitionFile = serde_yaml::from_str(yaml)?;
        Definitions::from_file(file)
    }
}
