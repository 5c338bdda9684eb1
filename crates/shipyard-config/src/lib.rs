//! KDL configuration parsing for Shipyard.
//!
//! This crate handles parsing of:
//! - Orchestrator configuration (shipyard.kdl)
//! - Free-form pipeline declarations
//! - Variable interpolation

pub mod error;
mod kdl_util;
pub mod orchestrator;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use orchestrator::{
    EnvironmentsConfig, OrchestratorConfig, SourceConfig, SourceKind, StepCommands,
    load_orchestrator_config, parse_orchestrator_config,
};
pub use variables::{VariableContext, VariableContextBuilder};
