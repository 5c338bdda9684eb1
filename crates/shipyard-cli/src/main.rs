//! Shipyard CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Shipyard deployment pipeline CLI", long_about = None)]
struct Cli {
    /// Orchestrator configuration file
    #[arg(long, env = "SHIPYARD_CONFIG", default_value = "shipyard.kdl")]
    config: PathBuf,

    /// Source connection id or ARN, overriding the configuration
    #[arg(long, env = "SHIPYARD_CONNECTION_ID")]
    connection_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the deployment plan and print it as JSON
    Synth {
        /// Directory to write pipeline.json and the buildspec, role and template documents to
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a pipeline declaration
    Validate {
        /// Path to the pipeline file
        #[arg(default_value = "pipeline.kdl")]
        path: PathBuf,
    },
    /// Dry-run the deployment plan against the simulated engine
    Simulate {
        /// Stage or action to fail
        #[arg(long)]
        fail: Vec<String>,
        /// Commit id published by the source stage
        #[arg(long, default_value = "0000000")]
        commit_id: String,
        /// Custom variable available to action environments as `${KEY}`
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Synth { out } => {
            let config = commands::load_config(&cli.config, cli.connection_id)?;
            commands::synth::run(config, out.as_deref())?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Simulate {
            fail,
            commit_id,
            vars,
        } => {
            let config = commands::load_config(&cli.config, cli.connection_id)?;
            commands::simulate::run(config, fail, commit_id, vars).await?;
        }
    }

    Ok(())
}
