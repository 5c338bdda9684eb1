//! Plan synthesis command.

use anyhow::{Context, Result};
use shipyard_config::OrchestratorConfig;
use shipyard_scheduler::DeploymentOrchestrator;
use std::path::Path;
use tracing::info;

/// Assemble the plan; print it, or write every synthesized document to `out`.
pub fn run(config: OrchestratorConfig, out: Option<&Path>) -> Result<()> {
    let synthesis = DeploymentOrchestrator::new(config)
        .synthesize()
        .context("Failed to assemble deployment plan")?;
    let documents = synthesis.documents()?;

    let Some(out) = out else {
        let (_, pipeline) = &documents[0];
        println!("{}", serde_json::to_string_pretty(pipeline)?);
        return Ok(());
    };

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory: {}", out.display()))?;
    for (name, document) in &documents {
        let path = out.join(name);
        let body = serde_json::to_string_pretty(document)?;
        std::fs::write(&path, body + "\n")
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Wrote document");
    }

    println!(
        "Synthesized '{}' ({} stages) into {}",
        synthesis.pipeline.name(),
        synthesis.pipeline.stages().len(),
        out.display()
    );
    Ok(())
}
