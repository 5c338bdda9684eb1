//! Pipeline, stage and action definitions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::artifact::{ArtifactGraph, ArtifactName, ArtifactPath};
use crate::build::BuildStep;
use crate::{Error, Result};

/// Matches `${name}` and `${namespace.name}` references.
pub static VARIABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

/// Namespaces resolved by the runner rather than published by actions.
pub const BUILTIN_NAMESPACES: &[&str] = &["pipeline", "run", "stage", "env"];

/// Namespaced references (`namespace`, `name`) found in `input`.
pub fn namespaced_references(input: &str) -> Vec<(String, String)> {
    VARIABLE_REGEX
        .captures_iter(input)
        .filter_map(|caps| {
            caps[1]
                .split_once('.')
                .map(|(ns, name)| (ns.to_string(), name.to_string()))
        })
        .collect()
}

/// Kind of work an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Source,
    Build,
    Test,
    Deploy,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Source => write!(f, "source"),
            ActionKind::Build => write!(f, "build"),
            ActionKind::Test => write!(f, "test"),
            ActionKind::Deploy => write!(f, "deploy"),
        }
    }
}

/// Where source code is fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceProvider {
    /// Repository reached through a connection (GitHub, Bitbucket).
    Connection {
        owner: String,
        repo: String,
        branch: String,
        connection_arn: String,
    },
    /// Repository hosted in CodeCommit.
    CodeCommit { repository: String, branch: String },
}

impl SourceProvider {
    pub fn branch(&self) -> &str {
        match self {
            SourceProvider::Connection { branch, .. } => branch,
            SourceProvider::CodeCommit { branch, .. } => branch,
        }
    }

    /// `owner/repo` or the CodeCommit repository name.
    pub fn repository(&self) -> String {
        match self {
            SourceProvider::Connection { owner, repo, .. } => format!("{}/{}", owner, repo),
            SourceProvider::CodeCommit { repository, .. } => repository.clone(),
        }
    }
}

/// Fetch source and publish it as an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAction {
    pub provider: SourceProvider,
    pub output: ArtifactName,
}

impl SourceAction {
    pub fn new(provider: SourceProvider, output: ArtifactName) -> Self {
        Self { provider, output }
    }
}

/// Reads a deployed stack's output into an environment variable before the
/// action runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLookup {
    pub stack_name: String,
    pub output_key: String,
    pub env_var: String,
}

impl EndpointLookup {
    pub fn new(
        stack_name: impl Into<String>,
        output_key: impl Into<String>,
        env_var: impl Into<String>,
    ) -> Self {
        Self {
            stack_name: stack_name.into(),
            output_key: output_key.into(),
            env_var: env_var.into(),
        }
    }

    /// Shell command performing the same lookup inside a build environment.
    pub fn query_command(&self) -> String {
        format!(
            "{}=$(aws cloudformation describe-stacks --stack-name {} \
             --query \"Stacks[0].Outputs[?OutputKey=='{}'].OutputValue\" --output text)",
            self.env_var, self.stack_name, self.output_key
        )
    }
}

/// Run a build step over one or more input artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildAction {
    pub step: BuildStep,
    /// Input artifacts. The first is the primary source.
    pub inputs: Vec<ArtifactName>,
    pub outputs: Vec<ArtifactName>,
    pub lookups: Vec<EndpointLookup>,
}

impl BuildAction {
    pub fn new(step: BuildStep, input: ArtifactName) -> Self {
        Self {
            step,
            inputs: vec![input],
            outputs: Vec::new(),
            lookups: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: ArtifactName) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: ArtifactName) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn with_lookup(mut self, lookup: EndpointLookup) -> Self {
        self.lookups.push(lookup);
        self
    }
}

/// Create or update a stack from a template inside an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    pub template: ArtifactPath,
    pub stack_name: String,
    pub admin_permissions: bool,
}

impl DeployAction {
    pub fn new(template: ArtifactPath, stack_name: impl Into<String>) -> Self {
        Self {
            template,
            stack_name: stack_name.into(),
            admin_permissions: false,
        }
    }

    pub fn with_admin_permissions(mut self) -> Self {
        self.admin_permissions = true;
        self
    }
}

/// What an action does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSpec {
    Source(SourceAction),
    Build(BuildAction),
    Test(BuildAction),
    Deploy(DeployAction),
}

/// One unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    name: String,
    spec: ActionSpec,
    /// Environment variables; values may reference `${Namespace.Var}`.
    env: BTreeMap<String, String>,
    /// Stages that must have succeeded before this action runs.
    after: Vec<String>,
    /// Namespace under which this action publishes output variables.
    namespace: Option<String>,
}

impl Action {
    fn with_spec(name: impl Into<String>, spec: ActionSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            env: BTreeMap::new(),
            after: Vec::new(),
            namespace: None,
        }
    }

    pub fn source(name: impl Into<String>, source: SourceAction) -> Self {
        Self::with_spec(name, ActionSpec::Source(source))
    }

    pub fn build(name: impl Into<String>, build: BuildAction) -> Self {
        Self::with_spec(name, ActionSpec::Build(build))
    }

    pub fn test(name: impl Into<String>, build: BuildAction) -> Self {
        Self::with_spec(name, ActionSpec::Test(build))
    }

    pub fn deploy(name: impl Into<String>, deploy: DeployAction) -> Self {
        Self::with_spec(name, ActionSpec::Deploy(deploy))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.after.push(stage.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ActionSpec {
        &self.spec
    }

    pub fn kind(&self) -> ActionKind {
        match self.spec {
            ActionSpec::Source(_) => ActionKind::Source,
            ActionSpec::Build(_) => ActionKind::Build,
            ActionSpec::Test(_) => ActionKind::Test,
            ActionSpec::Deploy(_) => ActionKind::Deploy,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn after_stages(&self) -> &[String] {
        &self.after
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn inputs(&self) -> Vec<&ArtifactName> {
        match &self.spec {
            ActionSpec::Source(_) => Vec::new(),
            ActionSpec::Build(b) | ActionSpec::Test(b) => b.inputs.iter().collect(),
            ActionSpec::Deploy(d) => vec![&d.template.artifact],
        }
    }

    pub fn outputs(&self) -> Vec<&ArtifactName> {
        match &self.spec {
            ActionSpec::Source(s) => vec![&s.output],
            ActionSpec::Build(b) | ActionSpec::Test(b) => b.outputs.iter().collect(),
            ActionSpec::Deploy(_) => Vec::new(),
        }
    }

    pub fn lookups(&self) -> &[EndpointLookup] {
        match &self.spec {
            ActionSpec::Build(b) | ActionSpec::Test(b) => &b.lookups,
            _ => &[],
        }
    }
}

/// A named phase of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    name: String,
    actions: Vec<Action>,
}

impl Stage {
    /// Group `actions` under `name`. Actions inside a stage are unordered.
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("stage name is empty".to_string()));
        }
        if actions.is_empty() {
            return Err(Error::EmptyStage(name));
        }

        let mut seen = BTreeSet::new();
        for action in &actions {
            if !seen.insert(action.name()) {
                return Err(Error::Duplicate(format!(
                    "action '{}' in stage '{}'",
                    action.name(),
                    name
                )));
            }
        }

        Ok(Self { name, actions })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

/// What happens to the artifact store when the pipeline is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    #[default]
    Retain,
    Destroy,
}

/// A validated, immutable deployment plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineDefinition {
    name: String,
    stages: Vec<Stage>,
    artifact_removal: RemovalPolicy,
    artifacts: ArtifactGraph,
}

impl PipelineDefinition {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            stages: Vec::new(),
            artifact_removal: RemovalPolicy::default(),
        }
    }

    /// Validate `stages` as a plan in the given order.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("pipeline name is empty".to_string()));
        }
        if stages.is_empty() {
            return Err(Error::InvalidInput(format!(
                "pipeline '{}' declares no stages",
                name
            )));
        }

        check_unique_names(&stages)?;
        let artifacts = ArtifactGraph::from_stages(&stages)?;
        check_gates(&stages)?;
        check_variables(&stages)?;

        Ok(Self {
            name,
            stages,
            artifact_removal: RemovalPolicy::default(),
            artifacts,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn artifacts(&self) -> &ArtifactGraph {
        &self.artifacts
    }

    pub fn artifact_removal(&self) -> RemovalPolicy {
        self.artifact_removal
    }
}

fn check_unique_names(stages: &[Stage]) -> Result<()> {
    let mut stage_names = BTreeSet::new();
    let mut action_names = BTreeSet::new();
    let mut namespaces = BTreeSet::new();

    for stage in stages {
        if !stage_names.insert(stage.name()) {
            return Err(Error::Duplicate(format!("stage '{}'", stage.name())));
        }
        for action in stage.actions() {
            if !action_names.insert(action.name()) {
                return Err(Error::Duplicate(format!("action '{}'", action.name())));
            }
            if let Some(ns) = action.namespace() {
                if BUILTIN_NAMESPACES.contains(&ns) || !namespaces.insert(ns) {
                    return Err(Error::Duplicate(format!("variables namespace '{}'", ns)));
                }
            }
        }
    }
    Ok(())
}

/// Every `after` gate must name a stage strictly earlier than the action's own.
fn check_gates(stages: &[Stage]) -> Result<()> {
    for (index, stage) in stages.iter().enumerate() {
        for action in stage.actions() {
            for gate in action.after_stages() {
                let earlier = stages[..index].iter().any(|s| s.name() == gate);
                if !earlier {
                    return Err(Error::UnknownStage {
                        action: action.name().to_string(),
                        stage: gate.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Variables are only available once the publishing stage has completed.
fn check_variables(stages: &[Stage]) -> Result<()> {
    let mut published: BTreeSet<&str> = BTreeSet::new();

    for stage in stages {
        for action in stage.actions() {
            for value in action.env().values() {
                for (ns, var) in namespaced_references(value) {
                    if BUILTIN_NAMESPACES.contains(&ns.as_str()) {
                        continue;
                    }
                    if !published.contains(ns.as_str()) {
                        return Err(Error::UnknownVariable {
                            action: action.name().to_string(),
                            variable: format!("{}.{}", ns, var),
                        });
                    }
                }
            }
        }
        published.extend(stage.actions().iter().filter_map(|a| a.namespace()));
    }
    Ok(())
}

/// Builder for [`PipelineDefinition`]. Stage errors surface from `build`.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<(String, Vec<Action>)>,
    artifact_removal: RemovalPolicy,
}

impl PipelineBuilder {
    pub fn stage(mut self, name: impl Into<String>, actions: Vec<Action>) -> Self {
        self.stages.push((name.into(), actions));
        self
    }

    pub fn artifact_removal(mut self, policy: RemovalPolicy) -> Self {
        self.artifact_removal = policy;
        self
    }

    pub fn build(self) -> Result<PipelineDefinition> {
        let stages = self
            .stages
            .into_iter()
            .map(|(name, actions)| Stage::new(name, actions))
            .collect::<Result<Vec<_>>>()?;

        let mut pipeline = PipelineDefinition::new(self.name, stages)?;
        pipeline.artifact_removal = self.artifact_removal;
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::STANDARD_IMAGE;

    fn artifact(name: &str) -> ArtifactName {
        ArtifactName::new(name).unwrap()
    }

    fn step(name: &str) -> BuildStep {
        BuildStep::builder(name, STANDARD_IMAGE)
            .run(format!("echo {}", name))
            .build()
            .unwrap()
    }

    fn source(output: &str) -> Action {
        Action::source(
            "Fetch",
            SourceAction::new(
                SourceProvider::CodeCommit {
                    repository: "demo".to_string(),
                    branch: "master".to_string(),
                },
                artifact(output),
            ),
        )
        .with_namespace("SourceVariables")
    }

    #[test]
    fn test_stage_order_preserved() {
        let pipeline = PipelineDefinition::builder("ordered")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![Action::build(
                    "Compile",
                    BuildAction::new(step("compile"), artifact("src")).with_output(artifact("bin")),
                )],
            )
            .stage(
                "Ship",
                vec![Action::deploy(
                    "Deploy",
                    DeployAction::new(artifact("bin").at_path("app.json"), "AppStack"),
                )],
            )
            .build()
            .unwrap();

        assert_eq!(pipeline.stage_names(), vec!["Source", "Build", "Ship"]);
        assert_eq!(pipeline.stage_index("Ship"), Some(2));

        let graph = pipeline.artifacts();
        assert_eq!(graph.producer("bin").unwrap().action, "Compile");
        assert!(graph.producer("missing").is_none());
        let consumers: Vec<&str> = graph.consumers("bin").map(|c| c.stage.as_str()).collect();
        assert_eq!(consumers, vec!["Ship"]);
    }

    #[test]
    fn test_empty_stage_rejected() {
        let result = PipelineDefinition::builder("empty")
            .stage("Source", vec![source("src")])
            .stage("Nothing", vec![])
            .build();
        assert!(matches!(result, Err(Error::EmptyStage(name)) if name == "Nothing"));
    }

    #[test]
    fn test_missing_artifact_rejected() {
        let result = PipelineDefinition::builder("missing")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![Action::build(
                    "Compile",
                    BuildAction::new(step("compile"), artifact("nowhere")),
                )],
            )
            .build();
        assert!(matches!(
            result,
            Err(Error::MissingArtifact { artifact, .. }) if artifact == "nowhere"
        ));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let result = PipelineDefinition::builder("backwards")
            .stage("Source", vec![source("src")])
            .stage(
                "Deploy",
                vec![Action::deploy(
                    "Deploy",
                    DeployAction::new(artifact("bin").at_path("app.json"), "AppStack"),
                )],
            )
            .stage(
                "Build",
                vec![Action::build(
                    "Compile",
                    BuildAction::new(step("compile"), artifact("src")).with_output(artifact("bin")),
                )],
            )
            .build();
        assert!(matches!(
            result,
            Err(Error::ForwardReference {
                producer_stage: 2,
                consumer_stage: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_producer_rejected() {
        let result = PipelineDefinition::builder("dupes")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![Action::build(
                    "Compile",
                    BuildAction::new(step("compile"), artifact("src")).with_output(artifact("src")),
                )],
            )
            .build();
        assert!(matches!(result, Err(Error::DuplicateArtifact { .. })));
    }

    #[test]
    fn test_action_consuming_own_output_rejected() {
        let result = PipelineDefinition::builder("loop")
            .stage(
                "Only",
                vec![Action::build(
                    "Loop",
                    BuildAction::new(step("loop"), artifact("x")).with_output(artifact("x")),
                )],
            )
            .build();
        assert!(matches!(
            result,
            Err(Error::SelfReference { artifact, action }) if artifact == "x" && action == "Only/Loop"
        ));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let result = PipelineDefinition::builder("dupes")
            .stage("Source", vec![source("src")])
            .stage(
                "Source",
                vec![Action::build(
                    "Compile",
                    BuildAction::new(step("compile"), artifact("src")),
                )],
            )
            .build();
        assert!(matches!(result, Err(Error::Duplicate(_))));
    }

    #[test]
    fn test_gate_must_point_backwards() {
        let result = PipelineDefinition::builder("gates")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![
                    Action::build("Compile", BuildAction::new(step("compile"), artifact("src")))
                        .after("Release"),
                ],
            )
            .stage(
                "Release",
                vec![Action::build("Tag", BuildAction::new(step("tag"), artifact("src")))],
            )
            .build();
        assert!(matches!(
            result,
            Err(Error::UnknownStage { stage, .. }) if stage == "Release"
        ));
    }

    #[test]
    fn test_variables_need_earlier_publisher() {
        let ok = PipelineDefinition::builder("vars")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![
                    Action::build("Compile", BuildAction::new(step("compile"), artifact("src")))
                        .with_env("COMMIT", "${SourceVariables.CommitId}")
                        .with_env("PIPELINE", "${pipeline.name}"),
                ],
            )
            .build();
        assert!(ok.is_ok());

        let bad = PipelineDefinition::builder("vars")
            .stage("Source", vec![source("src")])
            .stage(
                "Build",
                vec![
                    Action::build("Compile", BuildAction::new(step("compile"), artifact("src")))
                        .with_env("VERSION", "${BuildVariables.Version}"),
                ],
            )
            .build();
        assert!(matches!(
            bad,
            Err(Error::UnknownVariable { variable, .. }) if variable == "BuildVariables.Version"
        ));
    }

    #[test]
    fn test_namespaced_references() {
        let refs = namespaced_references("${SourceVariables.CommitId}-${custom}-${run.id}");
        assert_eq!(
            refs,
            vec![
                ("SourceVariables".to_string(), "CommitId".to_string()),
                ("run".to_string(), "id".to_string()),
            ]
        );
    }

    #[test]
    fn test_lookup_query_command() {
        let lookup = EndpointLookup::new("PreProdApplicationStack", "UrlPreProd", "SERVICE_URL");
        let cmd = lookup.query_command();
        assert!(cmd.starts_with("SERVICE_URL=$(aws cloudformation describe-stacks"));
        assert!(cmd.contains("--stack-name PreProdApplicationStack"));
        assert!(cmd.contains("OutputKey=='UrlPreProd'"));
    }
}
