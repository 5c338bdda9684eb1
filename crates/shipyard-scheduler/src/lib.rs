//! Plan assembly and run orchestration for Shipyard.
//!
//! Assembles the deployment plan from configuration and drives runs of a
//! plan against an execution engine.

pub mod orchestrator;
pub mod runner;
pub mod simulate;

pub use orchestrator::DeploymentOrchestrator;
pub use runner::{PipelineEvent, PipelineResult, PipelineRunner};
pub use simulate::SimulatedEngine;
