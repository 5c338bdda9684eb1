//! Execution engine trait.
//!
//! An engine actually runs actions (fetches source, runs builds, deploys
//! stacks) and reports an opaque outcome for each. The plan itself never
//! performs work.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::Action;
use crate::{Result, RunId};

/// Everything an engine needs to run one action of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub run_id: RunId,
    pub pipeline: String,
    pub stage: String,
    pub stage_index: usize,
    /// Environment with variable references and endpoint lookups resolved.
    pub env: BTreeMap<String, String>,
}

/// Result reported by the engine for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionOutcome {
    /// Completed; `variables` are published under the action's namespace.
    Succeeded { variables: BTreeMap<String, String> },
    Failed { message: String },
}

impl ActionOutcome {
    pub fn succeeded() -> Self {
        ActionOutcome::Succeeded {
            variables: BTreeMap::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionOutcome::Failed {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionOutcome::Succeeded { .. })
    }
}

/// Trait for execution engines.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Name of this engine.
    fn name(&self) -> &'static str;

    /// Run one action to completion.
    async fn run_action(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome>;

    /// Read an output value of a deployed stack.
    async fn stack_output(&self, stack: &str, key: &str) -> Result<Option<String>>;
}
