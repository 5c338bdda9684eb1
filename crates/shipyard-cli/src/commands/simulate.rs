//! Dry-run command.

use anyhow::{Context, Result};
use shipyard_config::{OrchestratorConfig, VariableContext, VariableContextBuilder};
use shipyard_core::run::StageStatus;
use shipyard_scheduler::{DeploymentOrchestrator, PipelineEvent, PipelineRunner, SimulatedEngine};
use std::sync::Arc;

/// Run the deployment plan against the simulated engine.
pub async fn run(
    config: OrchestratorConfig,
    fail: Vec<String>,
    commit_id: String,
    vars: Vec<String>,
) -> Result<()> {
    let region = config
        .source
        .region
        .clone()
        .unwrap_or_else(|| "us-east-1".to_string());
    let synthesis = DeploymentOrchestrator::new(config)
        .synthesize()
        .context("Failed to assemble deployment plan")?;

    let engine = fail.into_iter().fold(
        SimulatedEngine::new()
            .with_commit_id(commit_id)
            .with_region(region)
            .with_applications(synthesis.applications),
        |engine, name| engine.fail(name),
    );
    let runner = PipelineRunner::new(Arc::new(engine));

    let var_ctx = variable_context(&vars)?;

    println!("Simulating pipeline: {}", synthesis.pipeline.name());
    println!("Stages: {}", synthesis.pipeline.stages().len());
    println!("\n--- Starting simulated run ---\n");

    let (mut rx, result_handle) = runner.execute(&synthesis.pipeline, var_ctx);

    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::RunStarted { run_id, .. } => {
                println!("Run {}\n", run_id);
            }
            PipelineEvent::StageStarted { stage, .. } => {
                println!("▶ Stage '{}' started", stage);
            }
            PipelineEvent::ActionCompleted {
                action,
                success,
                message,
                ..
            } => {
                if success {
                    println!("  ✓ {}", action);
                } else {
                    println!("  ✗ {}: {}", action, message.unwrap_or_default());
                }
            }
            PipelineEvent::StageCompleted { stage, success } => {
                if success {
                    println!("✓ Stage '{}' completed successfully\n", stage);
                } else {
                    println!("✗ Stage '{}' failed\n", stage);
                }
            }
            PipelineEvent::StageSkipped { stage, reason } => {
                println!("⊘ Stage '{}' skipped: {}", stage, reason);
            }
            PipelineEvent::PipelineCompleted { success } => {
                if success {
                    println!("--- Pipeline completed successfully ---");
                } else {
                    println!("--- Pipeline failed ---");
                }
            }
        }
    }

    let result = result_handle
        .await
        .context("Pipeline execution task failed")?;

    println!("\n--- Stage Summary ---");
    for stage in &result.run.stages {
        let status = match &stage.status {
            StageStatus::Succeeded => "✓ succeeded".to_string(),
            StageStatus::Failed { message } => format!("✗ failed: {}", message),
            StageStatus::Skipped { reason } => format!("⊘ skipped: {}", reason),
            StageStatus::Pending => "○ pending".to_string(),
            StageStatus::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", stage.name, status);
    }

    if result.success() {
        println!("\n✓ Pipeline succeeded!");
        Ok(())
    } else {
        anyhow::bail!("Pipeline {}", result.run.state);
    }
}

/// Process environment plus `KEY=VALUE` custom variables.
fn variable_context(vars: &[String]) -> Result<VariableContext> {
    let mut builder = VariableContextBuilder::new();
    for (key, value) in std::env::vars() {
        builder = builder.with_env(key, value);
    }
    for var in vars {
        let (key, value) = var
            .split_once('=')
            .with_context(|| format!("Variable '{}' is not of the form KEY=VALUE", var))?;
        builder = builder.with_custom(key, value);
    }
    Ok(builder.build())
}
