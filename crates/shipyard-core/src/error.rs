//! Error types for Shipyard.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("stage '{0}' declares no actions")]
    EmptyStage(String),

    #[error(
        "artifact '{artifact}' is consumed by '{consumer}' in stage {consumer_stage} \
         but produced by '{producer}' in later stage {producer_stage}"
    )]
    ForwardReference {
        artifact: String,
        producer: String,
        producer_stage: usize,
        consumer: String,
        consumer_stage: usize,
    },

    #[error("action '{action}' consumes its own output artifact '{artifact}'")]
    SelfReference { artifact: String, action: String },

    #[error("artifact '{artifact}' consumed by '{consumer}' has no producer")]
    MissingArtifact { artifact: String, consumer: String },

    #[error("artifact '{artifact}' is produced by both '{first}' and '{second}'")]
    DuplicateArtifact {
        artifact: String,
        first: String,
        second: String,
    },

    #[error("duplicate definition: {0}")]
    Duplicate(String),

    #[error("build step '{0}' declares no build commands")]
    NoBuildCommands(String),

    #[error("action '{action}' waits on stage '{stage}' which is unknown or not earlier")]
    UnknownStage { action: String, stage: String },

    #[error("action '{action}' references '{variable}' which no earlier action publishes")]
    UnknownVariable { action: String, variable: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("stack '{stack}' has no output '{key}'")]
    OutputNotFound { stack: String, key: String },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
