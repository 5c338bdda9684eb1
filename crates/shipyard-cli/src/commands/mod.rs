//! CLI command implementations.

pub mod simulate;
pub mod synth;

use anyhow::{Context, Result};
use shipyard_config::OrchestratorConfig;
use shipyard_config::pipeline::parse_pipeline;
use std::path::Path;

/// Read the orchestrator configuration, applying the connection override.
pub fn load_config(path: &Path, connection_id: Option<String>) -> Result<OrchestratorConfig> {
    let config = shipyard_config::load_orchestrator_config(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))?;

    Ok(match connection_id {
        Some(id) => config.with_connection_id(id),
        None => config,
    })
}

pub fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;
    match parse_pipeline(&content) {
        Ok(pipeline) => {
            println!("Pipeline '{}' is valid", pipeline.name());
            for (index, stage) in pipeline.stages().iter().enumerate() {
                let actions: Vec<&str> = stage.actions().iter().map(|a| a.name()).collect();
                println!("  {}. {} [{}]", index, stage.name(), actions.join(", "));
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
