//! Deployment orchestrator - assembles the six-stage deployment plan.
//!
//! Source → Unittest → BuildTemplate → Deploy<PreProd> → IntegTest → Deploy<Prod>
//!
//! BuildTemplate's `template` artifact feeds both deploy stages. IntegTest
//! waits for the pre-production deploy and discovers its endpoint from the
//! deployed stack's outputs; the production deploy waits for IntegTest.

use serde_json::Value;
use shipyard_config::OrchestratorConfig;
use shipyard_config::orchestrator::StepCommands;
use shipyard_core::application::{ApplicationDeploymentUnit, EnvironmentTarget};
use shipyard_core::artifact::ArtifactName;
use shipyard_core::build::BuildStep;
use shipyard_core::iam::{BUILD_SERVICE_PRINCIPAL, PolicySpec, RoleSpec};
use shipyard_core::pipeline::{
    Action, ActionSpec, BuildAction, DeployAction, EndpointLookup, PipelineDefinition,
    RemovalPolicy, SourceAction, SourceProvider,
};
use shipyard_core::{Error, Result};
use tracing::debug;

pub const SOURCE_STAGE: &str = "Source";
pub const UNITTEST_STAGE: &str = "Unittest";
pub const BUILD_TEMPLATE_STAGE: &str = "BuildTemplate";
pub const INTEG_TEST_STAGE: &str = "IntegTest";

pub const SOURCE_ARTIFACT: &str = "source";
pub const UNITTEST_ARTIFACT: &str = "unittest";
pub const TEMPLATE_ARTIFACT: &str = "template";

/// Namespace the source action publishes `CommitId` under.
pub const SOURCE_NAMESPACE: &str = "SourceVariables";
/// Environment variable carrying the pre-production endpoint into IntegTest.
pub const SERVICE_URL_ENV: &str = "SERVICE_URL";
/// Environment variable carrying the source revision into builds.
pub const COMMIT_ID_ENV: &str = "CODE_COMMIT_ID";

/// Name of the stage deploying to `target`.
pub fn deploy_stage(target: &EnvironmentTarget) -> String {
    format!("Deploy{}", target.label())
}

/// Assembles the deployment plan for one configuration.
#[derive(Debug, Clone)]
pub struct DeploymentOrchestrator {
    config: OrchestratorConfig,
}

/// Everything produced by one synthesis.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    pub pipeline: PipelineDefinition,
    pub applications: Vec<ApplicationDeploymentUnit>,
}

impl DeploymentOrchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Pre-production and production targets, in that order. The two
    /// targets must not generate any resource name in common.
    pub fn environments(&self) -> Result<(EnvironmentTarget, EnvironmentTarget)> {
        let preprod = EnvironmentTarget::new(&self.config.environments.preprod)?;
        let prod = EnvironmentTarget::new(&self.config.environments.prod)?;
        if preprod == prod {
            return Err(Error::InvalidInput(format!(
                "pre-production and production both use label '{}'",
                preprod
            )));
        }

        let preprod_names = ApplicationDeploymentUnit::for_target(preprod.clone()).resource_names();
        let prod_names = ApplicationDeploymentUnit::for_target(prod.clone()).resource_names();
        let shared: Vec<&str> = preprod_names
            .intersection(&prod_names)
            .map(String::as_str)
            .collect();
        if !shared.is_empty() {
            return Err(Error::InvalidInput(format!(
                "labels '{}' and '{}' generate the same resource names: {}",
                preprod,
                prod,
                shared.join(", ")
            )));
        }
        Ok((preprod, prod))
    }

    pub fn application_units(&self) -> Result<Vec<ApplicationDeploymentUnit>> {
        let (preprod, prod) = self.environments()?;
        Ok(vec![
            ApplicationDeploymentUnit::for_target(preprod),
            ApplicationDeploymentUnit::for_target(prod),
        ])
    }

    /// Build the plan. Pure and deterministic: the same configuration always
    /// yields an equal plan.
    pub fn assemble(&self) -> Result<PipelineDefinition> {
        let (preprod, prod) = self.environments()?;
        let source = ArtifactName::new(SOURCE_ARTIFACT)?;
        let unittest_out = ArtifactName::new(UNITTEST_ARTIFACT)?;
        let template = ArtifactName::new(TEMPLATE_ARTIFACT)?;
        let commit_ref = format!("${{{}.CommitId}}", SOURCE_NAMESPACE);

        let provider = self
            .config
            .source
            .to_provider()
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let source_action_name = match provider {
            SourceProvider::Connection { .. } => "GitHub",
            SourceProvider::CodeCommit { .. } => "CodeCommit",
        };
        let fetch = Action::source(
            source_action_name,
            SourceAction::new(provider, source.clone()),
        )
        .with_namespace(SOURCE_NAMESPACE);

        let unittest = Action::test(
            "DoUnittest",
            BuildAction::new(
                self.build_step("CodeBuildUnittest", &self.config.unittest, None)?,
                source.clone(),
            )
            .with_output(unittest_out),
        )
        .with_env(COMMIT_ID_ENV, commit_ref.clone());

        let build_template = Action::build(
            "BuildCfnTemplate",
            BuildAction::new(
                self.build_step("CodeBuildCdk", &self.config.template, None)?,
                source.clone(),
            )
            .with_output(template.clone()),
        )
        .with_env(COMMIT_ID_ENV, commit_ref);

        let deploy_preprod_stage = deploy_stage(&preprod);
        let deploy_preprod = Action::deploy(
            format!("Deploy{}Application", preprod.label()),
            DeployAction::new(template.at_path(preprod.template_file()), preprod.stack_name())
                .with_admin_permissions(),
        );

        let lookup = EndpointLookup::new(preprod.stack_name(), preprod.url_output(), SERVICE_URL_ENV);
        let integ_role = RoleSpec::new(&self.config.integ_role_name, BUILD_SERVICE_PRINCIPAL)
            .with_policy(
                PolicySpec::new("CodeBuildReadCloudFormation").allow(["cloudformation:*"], ["*"]),
            );
        let integ_step = self.build_step(
            "CodeBuildIntegTest",
            &self.config.integtest,
            Some((&lookup, integ_role)),
        )?;
        let integ_test = Action::test(
            INTEG_TEST_STAGE,
            BuildAction::new(integ_step, source).with_lookup(lookup),
        )
        .after(deploy_preprod_stage.clone());

        let deploy_prod = Action::deploy(
            format!("Deploy{}Application", prod.label()),
            DeployAction::new(template.at_path(prod.template_file()), prod.stack_name())
                .with_admin_permissions(),
        )
        .after(INTEG_TEST_STAGE);

        let removal = if self.config.destroy_artifacts {
            RemovalPolicy::Destroy
        } else {
            RemovalPolicy::Retain
        };

        let plan = PipelineDefinition::builder(&self.config.pipeline_name)
            .artifact_removal(removal)
            .stage(SOURCE_STAGE, vec![fetch])
            .stage(UNITTEST_STAGE, vec![unittest])
            .stage(BUILD_TEMPLATE_STAGE, vec![build_template])
            .stage(deploy_preprod_stage, vec![deploy_preprod])
            .stage(INTEG_TEST_STAGE, vec![integ_test])
            .stage(deploy_stage(&prod), vec![deploy_prod])
            .build()?;

        debug!(pipeline = %plan.name(), stages = plan.stages().len(), "Assembled pipeline");
        Ok(plan)
    }

    /// Assemble the plan together with the application units it deploys.
    pub fn synthesize(&self) -> Result<Synthesis> {
        Ok(Synthesis {
            pipeline: self.assemble()?,
            applications: self.application_units()?,
        })
    }

    fn build_step(
        &self,
        name: &str,
        commands: &StepCommands,
        lookup: Option<(&EndpointLookup, RoleSpec)>,
    ) -> Result<BuildStep> {
        let mut builder = BuildStep::builder(name, &self.config.build_image);
        if let Some((lookup, role)) = lookup {
            builder = builder.install(lookup.query_command()).role(role);
        }
        for cmd in &commands.install {
            builder = builder.install(cmd);
        }
        for cmd in &commands.run {
            builder = builder.run(cmd);
        }
        if let Some(dir) = &commands.base_directory {
            builder = builder.base_directory(dir);
        }
        for pattern in &commands.files {
            builder = builder.file(pattern);
        }
        builder.build()
    }
}

impl Synthesis {
    /// Files to write for this synthesis: the plan, one buildspec per build
    /// step, a role document for each step that assumes a role, and one
    /// template per application stack.
    pub fn documents(&self) -> Result<Vec<(String, Value)>> {
        let mut docs = vec![(
            "pipeline.json".to_string(),
            serde_json::to_value(&self.pipeline).map_err(|e| Error::Internal(e.to_string()))?,
        )];

        for stage in self.pipeline.stages() {
            for action in stage.actions() {
                if let ActionSpec::Build(b) | ActionSpec::Test(b) = action.spec() {
                    docs.push((
                        format!("{}.buildspec.json", b.step.name()),
                        b.step.to_buildspec(),
                    ));
                    if let Some(role) = b.step.role() {
                        docs.push((role.document_file(), role.to_document()));
                    }
                }
            }
        }

        for app in &self.applications {
            docs.push((app.target().template_file(), app.to_template()));
        }
        Ok(docs)
    }
}
