//! In-process execution engine for dry runs.
//!
//! Nothing is fetched, built or deployed. Source actions publish a commit id,
//! deploy actions record the stack outputs the real stack would export, and
//! any stage or action can be told to fail.

use async_trait::async_trait;
use chrono::Utc;
use shipyard_core::Result;
use shipyard_core::application::ApplicationDeploymentUnit;
use shipyard_core::engine::{ActionContext, ActionOutcome, ExecutionEngine};
use shipyard_core::pipeline::{Action, ActionSpec};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::debug;

/// One action the engine was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    pub stage: String,
    pub action: String,
    pub env: BTreeMap<String, String>,
}

pub struct SimulatedEngine {
    commit_id: String,
    region: String,
    failing: BTreeSet<String>,
    /// Applications by stack name
    applications: BTreeMap<String, ApplicationDeploymentUnit>,
    /// Outputs of deployed stacks
    outputs: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    executed: Mutex<Vec<ExecutedAction>>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            commit_id: "0000000".to_string(),
            region: "us-east-1".to_string(),
            failing: BTreeSet::new(),
            applications: BTreeMap::new(),
            outputs: Mutex::new(BTreeMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_commit_id(mut self, commit_id: impl Into<String>) -> Self {
        self.commit_id = commit_id.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Fail every action of the stage, or the single action, named `name`.
    pub fn fail(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }

    pub fn with_applications(
        mut self,
        applications: impl IntoIterator<Item = ApplicationDeploymentUnit>,
    ) -> Self {
        for app in applications {
            self.applications.insert(app.stack_name().to_string(), app);
        }
        self
    }

    /// Actions run so far, in the order they were started.
    pub async fn executed(&self) -> Vec<ExecutedAction> {
        self.executed.lock().await.clone()
    }

    /// Stacks deployed so far with their outputs.
    pub async fn deployed(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.outputs.lock().await.clone()
    }

    fn endpoint(&self, app: &ApplicationDeploymentUnit) -> String {
        format!(
            "https://{}.execute-api.{}.amazonaws.com/prod/",
            app.api().name.to_lowercase(),
            self.region
        )
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionEngine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn run_action(&self, action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
        self.executed.lock().await.push(ExecutedAction {
            stage: ctx.stage.clone(),
            action: action.name().to_string(),
            env: ctx.env.clone(),
        });

        if self.failing.contains(&ctx.stage) || self.failing.contains(action.name()) {
            return Ok(ActionOutcome::failed("simulated failure"));
        }

        match action.spec() {
            ActionSpec::Source(source) => {
                let variables = BTreeMap::from([
                    ("CommitId".to_string(), self.commit_id.clone()),
                    ("BranchName".to_string(), source.provider.branch().to_string()),
                    ("RepositoryName".to_string(), source.provider.repository()),
                    ("AuthorDate".to_string(), Utc::now().to_rfc3339()),
                    (
                        "CommitMessage".to_string(),
                        format!("simulated commit {}", self.commit_id),
                    ),
                ]);
                Ok(ActionOutcome::Succeeded { variables })
            }
            ActionSpec::Build(_) | ActionSpec::Test(_) => Ok(ActionOutcome::succeeded()),
            ActionSpec::Deploy(deploy) => {
                let mut stack_outputs = BTreeMap::new();
                if let Some(app) = self.applications.get(&deploy.stack_name) {
                    stack_outputs.insert(app.url_output().key.clone(), self.endpoint(app));
                }
                debug!(stack = %deploy.stack_name, outputs = stack_outputs.len(), "Simulated deploy");
                self.outputs
                    .lock()
                    .await
                    .insert(deploy.stack_name.clone(), stack_outputs);
                Ok(ActionOutcome::succeeded())
            }
        }
    }

    async fn stack_output(&self, stack: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .outputs
            .lock()
            .await
            .get(stack)
            .and_then(|outputs| outputs.get(key))
            .cloned())
    }
}
