//! Readiness CLI
//!
//! Offline checks against definition files:
//! 1. Validate a definitions directory (catalog, dependency map, phases)
//! 2. Evaluate one phase or the whole flow against a JSON flow snapshot
//! 3. Aggregate a snapshot's decision records into a flow score
//!
//! Usage:
//!   cargo run --features cli --bin readiness_cli -- check --definitions config/definitions
//!   cargo run --features cli --bin readiness_cli -- status \
//!     --definitions config/definitions --snapshot flow.json --phase assessment
//!   cargo run --features cli --bin readiness_cli -- score --snapshot flow.json

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ob_readiness::{
    aggregate, CatalogProvider, DefinitionLoader, Definitions, FlowSnapshot, PhaseDefinitionProvider,
    PhaseReadinessValidator, TracingSink,
};

/// Offline readiness checks
#[derive(Parser, Debug)]
#[command(name = "readiness_cli")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate definition files and print a summary
    Check {
        #[arg(long, env = "READINESS_DEFINITIONS_DIR")]
        definitions: PathBuf,
    },
    /// Evaluate phase readiness for a flow snapshot
    Status {
        #[arg(long, env = "READINESS_DEFINITIONS_DIR")]
        definitions: PathBuf,
        #[arg(long)]
        snapshot: PathBuf,
        /// Evaluate a single phase instead of the whole flow
        #[arg(long)]
        phase: Option<String>,
    },
    /// Aggregate decision records into a flow score
    Score {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Check { definitions } => {
            let defs = load_definitions(&definitions)?;
            for subject_type in defs.catalog.subject_types() {
                let rules = defs.catalog.rules(subject_type);
                let required = rules.iter().filter(|r| r.required).count();
                println!(
                    "{:<20} {:>3} questions ({} required)",
                    subject_type,
                    rules.len(),
                    required
                );
            }
            println!(
                "dependency map v{}: {} volatile fields",
                defs.dependency_map.version,
                defs.dependency_map.edges.len()
            );
            for phase in defs.phases.phases() {
                println!(
                    "phase {:>2} {:<20} {} criteria",
                    phase.ordinal,
                    phase.name,
                    phase.criteria.len()
                );
            }
        }
        Command::Status {
            definitions,
            snapshot,
            phase,
        } => {
            let defs = load_definitions(&definitions)?;
            let snapshot = load_snapshot(&snapshot)?;
            let validator = PhaseReadinessValidator::new(Arc::new(defs.phases), Arc::new(TracingSink));
            let output = match phase {
                Some(name) => serde_json::to_string_pretty(&validator.validate_phase(&name, &snapshot)?)?,
                None => serde_json::to_string_pretty(&validator.overall_status(&snapshot)?)?,
            };
            println!("{}", output);
        }
        Command::Score { snapshot } => {
            let snapshot = load_snapshot(&snapshot)?;
            println!("{:.1}", aggregate(&snapshot.decisions));
        }
    }

    Ok(())
}

fn load_definitions(dir: &Path) -> Result<Definitions> {
    DefinitionLoader::load_from_dir(dir)
        .with_context(|| format!("failed to load definitions from {}", dir.display()))
}

fn load_snapshot(path: &Path) -> Result<FlowSnapshot> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid snapshot {}", path.display()))
}
