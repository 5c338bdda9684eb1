//! Pipeline runner - drives one run of a plan through its stages.

use chrono::Utc;
use futures::future::join_all;
use shipyard_config::VariableContext;
use shipyard_core::engine::{ActionContext, ActionOutcome, ExecutionEngine};
use shipyard_core::pipeline::{Action, PipelineDefinition, Stage};
use shipyard_core::run::{PipelineRun, RunState, StageResult, StageStatus};
use shipyard_core::{Error, Result, RunId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        run_id: RunId,
        pipeline: String,
    },
    StageStarted {
        stage: String,
        index: usize,
    },
    ActionCompleted {
        stage: String,
        action: String,
        success: bool,
        message: Option<String>,
    },
    StageCompleted {
        stage: String,
        success: bool,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    PipelineCompleted {
        success: bool,
    },
}

/// Result of a run.
#[derive(Debug)]
pub struct PipelineResult {
    pub run: PipelineRun,
    /// Variables published by actions during the run, keyed by namespace.
    pub variables: BTreeMap<String, BTreeMap<String, String>>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.run.success()
    }
}

type StageVariables = Vec<(String, BTreeMap<String, String>)>;

/// Runs plans against an execution engine.
///
/// Stages run strictly in plan order. Actions inside a stage run
/// concurrently and the stage succeeds only if all of them do. The first
/// failing stage ends the run; every later stage is skipped.
pub struct PipelineRunner {
    engine: Arc<dyn ExecutionEngine>,
}

impl PipelineRunner {
    pub fn new(engine: Arc<dyn ExecutionEngine>) -> Self {
        Self { engine }
    }

    /// Start a run, returning a channel of events and a handle to get the
    /// final result.
    ///
    /// `var_ctx` seeds interpolation of action environments, e.g. `${env.X}`
    /// and custom variables. Pipeline and run variables are filled in here.
    pub fn execute(
        &self,
        plan: &PipelineDefinition,
        var_ctx: VariableContext,
    ) -> (
        mpsc::Receiver<PipelineEvent>,
        tokio::task::JoinHandle<PipelineResult>,
    ) {
        let (tx, rx) = mpsc::channel(100);
        let engine = self.engine.clone();
        let plan = plan.clone();

        let handle =
            tokio::spawn(async move { Self::execute_inner(engine, plan, var_ctx, tx).await });

        (rx, handle)
    }

    async fn execute_inner(
        engine: Arc<dyn ExecutionEngine>,
        plan: PipelineDefinition,
        mut var_ctx: VariableContext,
        tx: mpsc::Sender<PipelineEvent>,
    ) -> PipelineResult {
        let mut run = PipelineRun::new(&plan);
        var_ctx.pipeline_name = plan.name().to_string();
        var_ctx.run_id = run.id.to_string();

        info!(pipeline = %plan.name(), run_id = %run.id, engine = engine.name(), "Starting run");
        let _ = tx
            .send(PipelineEvent::RunStarted {
                run_id: run.id,
                pipeline: plan.name().to_string(),
            })
            .await;

        run.state = run.state.begin(&plan).unwrap_or_else(|e| {
            error!(error = %e, "Could not start run");
            RunState::Failed {
                stage: String::new(),
            }
        });

        while let RunState::InStage { index, name } = run.state.clone() {
            let stage = &plan.stages()[index];
            var_ctx.enter_stage(&name, index);

            let _ = tx
                .send(PipelineEvent::StageStarted {
                    stage: name.clone(),
                    index,
                })
                .await;
            run.stages[index].status = StageStatus::Running;
            run.stages[index].started_at = Some(Utc::now());

            let outcome =
                Self::execute_stage(&engine, &plan, stage, index, &run, &var_ctx, &tx).await;

            let success = match outcome {
                Ok(published) => {
                    for (namespace, variables) in published {
                        var_ctx.publish(&namespace, variables);
                    }
                    info!(stage = %name, "Stage completed successfully");
                    run.stages[index].status = StageStatus::Succeeded;
                    true
                }
                Err(message) => {
                    error!(stage = %name, error = %message, "Stage failed");
                    run.stages[index].status = StageStatus::Failed { message };
                    false
                }
            };
            run.stages[index].finished_at = Some(Utc::now());

            let _ = tx
                .send(PipelineEvent::StageCompleted {
                    stage: name.clone(),
                    success,
                })
                .await;

            run.state = run
                .state
                .complete_stage(&plan, success)
                .unwrap_or_else(|e| {
                    error!(stage = %name, error = %e, "Invalid run transition");
                    RunState::Failed { stage: name.clone() }
                });
        }

        if let RunState::Failed { stage: failed } = &run.state {
            let reason = format!("stage '{}' failed", failed);
            for result in run
                .stages
                .iter_mut()
                .filter(|s| s.status == StageStatus::Pending)
            {
                info!(stage = %result.name, %reason, "Skipping stage");
                result.status = StageStatus::Skipped {
                    reason: reason.clone(),
                };
                let _ = tx
                    .send(PipelineEvent::StageSkipped {
                        stage: result.name.clone(),
                        reason: reason.clone(),
                    })
                    .await;
            }
        }

        run.finished_at = Some(Utc::now());
        let success = run.success();
        info!(run_id = %run.id, state = %run.state, "Run finished");
        let _ = tx.send(PipelineEvent::PipelineCompleted { success }).await;

        PipelineResult {
            run,
            variables: var_ctx.namespaces,
        }
    }

    /// Run every action of a stage concurrently. Returns the variables to
    /// publish, or the failure messages of the failed actions.
    async fn execute_stage(
        engine: &Arc<dyn ExecutionEngine>,
        plan: &PipelineDefinition,
        stage: &Stage,
        index: usize,
        run: &PipelineRun,
        var_ctx: &VariableContext,
        tx: &mpsc::Sender<PipelineEvent>,
    ) -> std::result::Result<StageVariables, String> {
        let runs = stage.actions().iter().map(|action| async move {
            let outcome = Self::execute_action(engine, plan, stage, index, run, var_ctx, action)
                .await
                .unwrap_or_else(|e| ActionOutcome::failed(e.to_string()));
            (action, outcome)
        });
        let outcomes = join_all(runs).await;

        let mut published = Vec::new();
        let mut failures = Vec::new();
        for (action, outcome) in outcomes {
            let message = match outcome {
                ActionOutcome::Succeeded { variables } => {
                    if let Some(namespace) = action.namespace() {
                        published.push((namespace.to_string(), variables));
                    }
                    None
                }
                ActionOutcome::Failed { message } => {
                    warn!(stage = %stage.name(), action = %action.name(), %message, "Action failed");
                    failures.push(format!("{}: {}", action.name(), message));
                    Some(message)
                }
            };
            let _ = tx
                .send(PipelineEvent::ActionCompleted {
                    stage: stage.name().to_string(),
                    action: action.name().to_string(),
                    success: message.is_none(),
                    message,
                })
                .await;
        }

        if failures.is_empty() {
            Ok(published)
        } else {
            Err(failures.join("; "))
        }
    }

    async fn execute_action(
        engine: &Arc<dyn ExecutionEngine>,
        plan: &PipelineDefinition,
        stage: &Stage,
        index: usize,
        run: &PipelineRun,
        var_ctx: &VariableContext,
        action: &Action,
    ) -> Result<ActionOutcome> {
        for gate in action.after_stages() {
            if !gate_passed(&run.stages, gate) {
                return Ok(ActionOutcome::failed(format!(
                    "waiting on stage '{}' which has not succeeded",
                    gate
                )));
            }
        }

        let mut env = var_ctx.interpolate_map(action.env());
        for value in action.env().values() {
            if let Some(variable) = var_ctx.unresolved(value).into_iter().next() {
                return Err(Error::UnknownVariable {
                    action: action.name().to_string(),
                    variable,
                });
            }
        }

        for lookup in action.lookups() {
            let value = engine
                .stack_output(&lookup.stack_name, &lookup.output_key)
                .await?
                .ok_or_else(|| Error::OutputNotFound {
                    stack: lookup.stack_name.clone(),
                    key: lookup.output_key.clone(),
                })?;
            env.insert(lookup.env_var.clone(), value);
        }

        let ctx = ActionContext {
            run_id: run.id,
            pipeline: plan.name().to_string(),
            stage: stage.name().to_string(),
            stage_index: index,
            env,
        };

        info!(stage = %stage.name(), action = %action.name(), kind = %action.kind(), "Running action");
        engine.run_action(action, &ctx).await
    }
}

fn gate_passed(stages: &[StageResult], gate: &str) -> bool {
    stages
        .iter()
        .find(|s| s.name == gate)
        .map(|s| s.status.is_success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{DeploymentOrchestrator, SERVICE_URL_ENV};
    use crate::simulate::SimulatedEngine;
    use async_trait::async_trait;
    use shipyard_config::{OrchestratorConfig, SourceConfig};
    use shipyard_core::artifact::ArtifactName;
    use shipyard_core::build::{BuildStep, STANDARD_IMAGE};
    use shipyard_core::pipeline::{BuildAction, SourceAction, SourceProvider};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn orchestrator() -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(OrchestratorConfig::new(
            "CicdPipelineDemo",
            SourceConfig::connection(
                "cdk-entest",
                "cicd-integration-test",
                "arn:aws:codestar-connections:us-east-1:111111111111:connection/abc",
            ),
        ))
    }

    async fn run_with(engine: Arc<SimulatedEngine>) -> (Vec<PipelineEvent>, PipelineResult) {
        let synthesis = orchestrator().synthesize().unwrap();
        let runner = PipelineRunner::new(engine);
        let (mut rx, handle) = runner.execute(&synthesis.pipeline, VariableContext::new());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    fn engine() -> SimulatedEngine {
        let synthesis = orchestrator().synthesize().unwrap();
        SimulatedEngine::new().with_applications(synthesis.applications)
    }

    #[tokio::test]
    async fn test_successful_run() {
        let engine = Arc::new(engine());
        let (events, result) = run_with(engine.clone()).await;

        assert!(result.success());
        assert_eq!(result.run.state, RunState::Succeeded);
        assert!(result.run.stages.iter().all(|s| s.status.is_success()));
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::PipelineCompleted { success: true })
        ));

        let executed: Vec<String> = engine
            .executed()
            .await
            .into_iter()
            .map(|e| e.stage)
            .collect();
        assert_eq!(
            executed,
            vec![
                "Source",
                "Unittest",
                "BuildTemplate",
                "DeployPreProd",
                "IntegTest",
                "DeployProd"
            ]
        );
    }

    #[tokio::test]
    async fn test_preprod_failure_blocks_integ_and_prod() {
        let engine = Arc::new(engine().fail("DeployPreProd"));
        let (events, result) = run_with(engine.clone()).await;

        assert!(!result.success());
        assert_eq!(
            result.run.state,
            RunState::Failed {
                stage: "DeployPreProd".to_string()
            }
        );
        for stage in ["IntegTest", "DeployProd"] {
            let status = &result.run.stage(stage).unwrap().status;
            assert!(matches!(status, StageStatus::Skipped { .. }));
            assert!(!status.was_executed());
        }

        let executed: Vec<String> = engine
            .executed()
            .await
            .into_iter()
            .map(|e| e.stage)
            .collect();
        assert!(!executed.iter().any(|s| s == "IntegTest" || s == "DeployProd"));

        let skipped = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::StageSkipped { .. }))
            .count();
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn test_commit_id_reaches_unittest() {
        let engine = Arc::new(engine().with_commit_id("9f1c2e7"));
        let (_, result) = run_with(engine.clone()).await;

        assert!(result.success());
        assert_eq!(result.variables["SourceVariables"]["CommitId"], "9f1c2e7");

        let executed = engine.executed().await;
        let unittest = executed.iter().find(|e| e.stage == "Unittest").unwrap();
        assert_eq!(unittest.env["CODE_COMMIT_ID"], "9f1c2e7");
    }

    #[tokio::test]
    async fn test_integ_test_receives_preprod_url() {
        let engine = Arc::new(engine().with_region("eu-west-1"));
        let (_, result) = run_with(engine.clone()).await;
        assert!(result.success());

        let executed = engine.executed().await;
        let integ = executed.iter().find(|e| e.stage == "IntegTest").unwrap();
        assert_eq!(
            integ.env[SERVICE_URL_ENV],
            "https://apigwdemopreprod.execute-api.eu-west-1.amazonaws.com/prod/"
        );
    }

    #[tokio::test]
    async fn test_missing_stack_output_fails_integ_test() {
        // No applications registered, so deploys publish no outputs.
        let engine = Arc::new(SimulatedEngine::new());
        let (events, result) = run_with(engine).await;

        assert_eq!(
            result.run.state,
            RunState::Failed {
                stage: "IntegTest".to_string()
            }
        );
        let message = events.iter().find_map(|e| match e {
            PipelineEvent::ActionCompleted {
                action,
                message: Some(m),
                ..
            } if action == "IntegTest" => Some(m.clone()),
            _ => None,
        });
        assert!(message.unwrap().contains("UrlPreProd"));
        assert!(matches!(
            result.run.stage("DeployProd").unwrap().status,
            StageStatus::Skipped { .. }
        ));
    }

    /// Source, a stage of three sibling builds, then a final check.
    fn fan_out_plan() -> PipelineDefinition {
        let src = ArtifactName::new("src").unwrap();
        let build = |name: &str| {
            let step = BuildStep::builder(name, STANDARD_IMAGE)
                .run(format!("make {}", name))
                .build()
                .unwrap();
            BuildAction::new(step, src.clone())
        };

        PipelineDefinition::builder("fan-out")
            .stage(
                "Source",
                vec![
                    Action::source(
                        "Fetch",
                        SourceAction::new(
                            SourceProvider::CodeCommit {
                                repository: "demo".to_string(),
                                branch: "master".to_string(),
                            },
                            src.clone(),
                        ),
                    )
                    .with_namespace("SourceVariables"),
                ],
            )
            .stage(
                "Build",
                vec![
                    Action::build("Compile", build("compile")).with_namespace("CompileVariables"),
                    Action::build("Lint", build("lint")),
                    Action::build("Docs", build("docs")),
                ],
            )
            .stage("Check", vec![Action::test("Smoke", build("smoke"))])
            .build()
            .unwrap()
    }

    async fn run_plan(
        plan: &PipelineDefinition,
        engine: Arc<dyn ExecutionEngine>,
    ) -> (Vec<PipelineEvent>, PipelineResult) {
        let runner = PipelineRunner::new(engine);
        let (mut rx, handle) = runner.execute(plan, VariableContext::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, handle.await.unwrap())
    }

    #[tokio::test]
    async fn test_sibling_failures_fail_stage_as_unit() {
        let plan = fan_out_plan();
        let engine = Arc::new(SimulatedEngine::new().fail("Lint").fail("Docs"));
        let (events, result) = run_plan(&plan, engine.clone()).await;

        // Every sibling ran, including the one that succeeded.
        let build_actions: Vec<String> = engine
            .executed()
            .await
            .into_iter()
            .filter(|e| e.stage == "Build")
            .map(|e| e.action)
            .collect();
        assert_eq!(build_actions.len(), 3);
        assert!(build_actions.iter().any(|a| a == "Compile"));

        let completed: Vec<(String, bool)> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::ActionCompleted {
                    stage,
                    action,
                    success,
                    ..
                } if stage == "Build" => Some((action.clone(), *success)),
                _ => None,
            })
            .collect();
        assert_eq!(
            completed,
            vec![
                ("Compile".to_string(), true),
                ("Lint".to_string(), false),
                ("Docs".to_string(), false),
            ]
        );

        assert_eq!(
            result.run.stage("Build").unwrap().status,
            StageStatus::Failed {
                message: "Lint: simulated failure; Docs: simulated failure".to_string()
            }
        );
        assert_eq!(
            result.run.state,
            RunState::Failed {
                stage: "Build".to_string()
            }
        );
        assert!(matches!(
            result.run.stage("Check").unwrap().status,
            StageStatus::Skipped { .. }
        ));

        // A failed stage publishes nothing, even for the siblings that passed.
        assert!(result.variables.contains_key("SourceVariables"));
        assert!(!result.variables.contains_key("CompileVariables"));
    }

    #[tokio::test]
    async fn test_successful_fan_out_publishes_namespaces() {
        let plan = fan_out_plan();
        let (_, result) = run_plan(&plan, Arc::new(SimulatedEngine::new())).await;

        assert!(result.success());
        assert!(result.variables.contains_key("CompileVariables"));
    }

    /// Holds every Build action until all three are running at once.
    struct RendezvousEngine {
        barrier: Barrier,
    }

    #[async_trait]
    impl ExecutionEngine for RendezvousEngine {
        fn name(&self) -> &'static str {
            "rendezvous"
        }

        async fn run_action(&self, _action: &Action, ctx: &ActionContext) -> Result<ActionOutcome> {
            if ctx.stage == "Build" {
                self.barrier.wait().await;
            }
            Ok(ActionOutcome::succeeded())
        }

        async fn stack_output(&self, _stack: &str, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_stage_actions_run_concurrently() {
        let plan = fan_out_plan();
        let engine = Arc::new(RendezvousEngine {
            barrier: Barrier::new(3),
        });

        let (_, result) = tokio::time::timeout(Duration::from_secs(5), run_plan(&plan, engine))
            .await
            .expect("build actions did not run concurrently");
        assert!(result.success());
    }

    struct BrokenEngine;

    #[async_trait]
    impl ExecutionEngine for BrokenEngine {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run_action(&self, _action: &Action, _ctx: &ActionContext) -> Result<ActionOutcome> {
            Err(Error::ExecutionFailed("engine unavailable".to_string()))
        }

        async fn stack_output(&self, _stack: &str, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_engine_error_fails_first_stage() {
        let plan = orchestrator().assemble().unwrap();
        let runner = PipelineRunner::new(Arc::new(BrokenEngine));
        let (mut rx, handle) = runner.execute(&plan, VariableContext::new());
        while rx.recv().await.is_some() {}
        let result = handle.await.unwrap();

        assert_eq!(
            result.run.state,
            RunState::Failed {
                stage: "Source".to_string()
            }
        );
        let skipped = result
            .run
            .stages
            .iter()
            .filter(|s| matches!(s.status, StageStatus::Skipped { .. }))
            .count();
        assert_eq!(skipped, 5);
    }

    #[test]
    fn test_gate_passed() {
        let stages = vec![
            StageResult {
                name: "DeployPreProd".to_string(),
                status: StageStatus::Succeeded,
                started_at: None,
                finished_at: None,
            },
            StageResult {
                name: "IntegTest".to_string(),
                status: StageStatus::Failed {
                    message: "boom".to_string(),
                },
                started_at: None,
                finished_at: None,
            },
        ];
        assert!(gate_passed(&stages, "DeployPreProd"));
        assert!(!gate_passed(&stages, "IntegTest"));
        assert!(!gate_passed(&stages, "Missing"));
    }
}
