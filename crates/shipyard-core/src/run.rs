//! Per-run state of a pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineDefinition;
use crate::{Error, Result, RunId};

/// Where a run is in the plan.
///
/// Runs move strictly forward through the stages. A failing stage moves the
/// run to `Failed` and nothing after it executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    InStage { index: usize, name: String },
    Succeeded,
    Failed { stage: String },
}

impl RunState {
    /// Enter the first stage.
    pub fn begin(&self, plan: &PipelineDefinition) -> Result<RunState> {
        match self {
            RunState::Pending => Ok(Self::enter(plan, 0)),
            other => Err(Error::InvalidInput(format!(
                "cannot start a run that is {}",
                other
            ))),
        }
    }

    /// Record the outcome of the current stage.
    pub fn complete_stage(&self, plan: &PipelineDefinition, succeeded: bool) -> Result<RunState> {
        match self {
            RunState::InStage { name, .. } if !succeeded => Ok(RunState::Failed {
                stage: name.clone(),
            }),
            RunState::InStage { index, .. } => Ok(Self::enter(plan, index + 1)),
            other => Err(Error::InvalidInput(format!(
                "no stage is running, run is {}",
                other
            ))),
        }
    }

    fn enter(plan: &PipelineDefinition, index: usize) -> RunState {
        match plan.stages().get(index) {
            Some(stage) => RunState::InStage {
                index,
                name: stage.name().to_string(),
            },
            None => RunState::Succeeded,
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Pending => write!(f, "pending"),
            RunState::InStage { name, .. } => write!(f, "in stage {}", name),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed { stage } => write!(f, "failed in {}", stage),
        }
    }
}

/// Status of a stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    /// Never executed because an earlier stage failed.
    Skipped { reason: String },
}

impl StageStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StageStatus::Succeeded)
    }

    /// Whether the engine was asked to run anything for this stage.
    pub fn was_executed(&self) -> bool {
        matches!(
            self,
            StageStatus::Running | StageStatus::Succeeded | StageStatus::Failed { .. }
        )
    }
}

/// Result of one stage in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline: String,
    pub state: RunState,
    pub stages: Vec<StageResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(plan: &PipelineDefinition) -> Self {
        Self {
            id: RunId::new(),
            pipeline: plan.name().to_string(),
            state: RunState::Pending,
            stages: plan
                .stages()
                .iter()
                .map(|s| StageResult {
                    name: s.name().to_string(),
                    status: StageStatus::Pending,
                    started_at: None,
                    finished_at: None,
                })
                .collect(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn success(&self) -> bool {
        self.state == RunState::Succeeded
    }
}
