//! Orchestrator configuration.
//!
//! Everything that differs between instances of the deployment pipeline
//! (source coordinates, connection identifiers, environment labels, build
//! commands) lives here and is passed to the orchestrator at assembly time.

use crate::kdl_util::{first_string_arg, required_string_arg, string_prop};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use shipyard_core::build::STANDARD_IMAGE;
use shipyard_core::pipeline::SourceProvider;
use std::path::Path;

/// Settings for one deployment pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub pipeline_name: String,
    pub source: SourceConfig,
    /// Image used by every build step.
    pub build_image: String,
    pub environments: EnvironmentsConfig,
    pub unittest: StepCommands,
    pub template: StepCommands,
    pub integtest: StepCommands,
    /// Role the integration tests run with.
    pub integ_role_name: String,
    /// Delete the artifact store together with the pipeline.
    pub destroy_artifacts: bool,
}

/// Kind of source repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Third-party host reached through a connection.
    Connection,
    CodeCommit,
}

/// Where the pipeline fetches its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub owner: Option<String>,
    pub repo: String,
    pub branch: String,
    /// Connection id or full connection ARN.
    pub connection_id: Option<String>,
    pub region: Option<String>,
    pub account: Option<String>,
}

/// Labels of the two deployment environments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentsConfig {
    pub preprod: String,
    pub prod: String,
}

impl Default for EnvironmentsConfig {
    fn default() -> Self {
        Self {
            preprod: "PreProd".to_string(),
            prod: "Prod".to_string(),
        }
    }
}

/// Commands and captured files of one build step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCommands {
    pub install: Vec<String>,
    pub run: Vec<String>,
    pub base_directory: Option<String>,
    pub files: Vec<String>,
}

impl StepCommands {
    fn new<I, R>(install: I, run: R) -> Self
    where
        I: IntoIterator<Item = &'static str>,
        R: IntoIterator<Item = &'static str>,
    {
        Self {
            install: install.into_iter().map(String::from).collect(),
            run: run.into_iter().map(String::from).collect(),
            base_directory: None,
            files: Vec::new(),
        }
    }
}

impl SourceConfig {
    /// Repository behind a connection, identified by `connection_id`.
    pub fn connection(
        owner: impl Into<String>,
        repo: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: SourceKind::Connection,
            owner: Some(owner.into()),
            repo: repo.into(),
            branch: "master".to_string(),
            connection_id: Some(connection_id.into()),
            region: None,
            account: None,
        }
    }

    pub fn codecommit(repository: impl Into<String>) -> Self {
        Self {
            kind: SourceKind::CodeCommit,
            owner: None,
            repo: repository.into(),
            branch: "master".to_string(),
            connection_id: None,
            region: None,
            account: None,
        }
    }

    /// Full connection ARN. A bare id is expanded with region and account.
    pub fn connection_arn(&self) -> ConfigResult<String> {
        let id = self
            .connection_id
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("source connection-id".to_string()))?;
        if id.starts_with("arn:") {
            return Ok(id.to_string());
        }

        let region = self
            .region
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("source region".to_string()))?;
        let account = self
            .account
            .as_deref()
            .ok_or_else(|| ConfigError::MissingField("source account".to_string()))?;
        Ok(format!(
            "arn:aws:codestar-connections:{}:{}:connection/{}",
            region, account, id
        ))
    }

    pub fn to_provider(&self) -> ConfigResult<SourceProvider> {
        match self.kind {
            SourceKind::Connection => Ok(SourceProvider::Connection {
                owner: self
                    .owner
                    .clone()
                    .ok_or_else(|| ConfigError::MissingField("source owner".to_string()))?,
                repo: self.repo.clone(),
                branch: self.branch.clone(),
                connection_arn: self.connection_arn()?,
            }),
            SourceKind::CodeCommit => Ok(SourceProvider::CodeCommit {
                repository: self.repo.clone(),
                branch: self.branch.clone(),
            }),
        }
    }
}

impl OrchestratorConfig {
    /// Configuration with the standard build commands.
    pub fn new(pipeline_name: impl Into<String>, source: SourceConfig) -> Self {
        let mut template = StepCommands::new(["npm install"], ["npm run cdk synth -- -o dist"]);
        template.base_directory = Some("dist".to_string());
        template.files = vec!["*.template.json".to_string()];

        Self {
            pipeline_name: pipeline_name.into(),
            source,
            build_image: STANDARD_IMAGE.to_string(),
            environments: EnvironmentsConfig::default(),
            unittest: StepCommands::new(
                ["echo $CODE_COMMIT_ID", "pip install -r requirements.txt"],
                ["python -m pytest -s -v unittests/test_lambda_logic.py"],
            ),
            template,
            integtest: StepCommands::new(
                ["echo $SERVICE_URL", "pip install -r requirements.txt"],
                ["python -m pytest -s -v integtests/test_service.py"],
            ),
            integ_role_name: "RoleForIntegrationTest".to_string(),
            destroy_artifacts: true,
        }
    }

    /// Replace the connection id chosen at invocation time.
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.source.connection_id = Some(connection_id.into());
        self
    }
}

/// Read and parse an orchestrator configuration file.
pub fn load_orchestrator_config(path: &Path) -> ConfigResult<OrchestratorConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_orchestrator_config(&content)
}

/// Parse orchestrator configuration from KDL text.
///
/// ```kdl
/// pipeline "CicdPipelineDemo" artifacts="destroy"
/// source "connection" owner="cdk-entest" repo="cicd-integration-test" branch="master" \
///     connection-id="475216ac-d91d-40c7-827d-c0da1c714f10" region="us-east-1" account="111111111111"
/// environments preprod="PreProd" prod="Prod"
/// unittest {
///     install "pip install -r requirements.txt"
///     run "python -m pytest -s -v unittests/test_lambda_logic.py"
/// }
/// ```
pub fn parse_orchestrator_config(kdl: &str) -> ConfigResult<OrchestratorConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = None;
    let mut destroy_artifacts = None;
    let mut source = None;

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = Some(required_string_arg(node, "pipeline name")?);
                destroy_artifacts = match string_prop(node, "artifacts").as_deref() {
                    None => None,
                    Some("destroy") => Some(true),
                    Some("retain") => Some(false),
                    Some(other) => {
                        return Err(ConfigError::InvalidValue {
                            field: "artifacts".to_string(),
                            message: format!("expected 'retain' or 'destroy', got '{}'", other),
                        });
                    }
                };
            }
            "source" => source = Some(parse_source(node)?),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
    let source = source.ok_or_else(|| ConfigError::MissingField("source".to_string()))?;
    let mut config = OrchestratorConfig::new(name, source);
    if let Some(destroy) = destroy_artifacts {
        config.destroy_artifacts = destroy;
    }

    for node in doc.nodes() {
        match node.name().value() {
            "build-image" => config.build_image = required_string_arg(node, "build-image")?,
            "integ-role" => config.integ_role_name = required_string_arg(node, "integ-role")?,
            "environments" => {
                if let Some(preprod) = string_prop(node, "preprod") {
                    config.environments.preprod = preprod;
                }
                if let Some(prod) = string_prop(node, "prod") {
                    config.environments.prod = prod;
                }
            }
            "unittest" => merge_step(node, &mut config.unittest)?,
            "template" => merge_step(node, &mut config.template)?,
            "integtest" => merge_step(node, &mut config.integtest)?,
            _ => {}
        }
    }

    if config.environments.preprod == config.environments.prod {
        return Err(ConfigError::InvalidValue {
            field: "environments".to_string(),
            message: "preprod and prod labels must differ".to_string(),
        });
    }

    Ok(config)
}

fn parse_source(node: &KdlNode) -> ConfigResult<SourceConfig> {
    let kind = match first_string_arg(node).as_deref() {
        Some("connection") | None => SourceKind::Connection,
        Some("codecommit") => SourceKind::CodeCommit,
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                field: "source".to_string(),
                message: format!("unknown source kind '{}'", other),
            });
        }
    };

    let repo = string_prop(node, "repo")
        .or_else(|| string_prop(node, "repository"))
        .ok_or_else(|| ConfigError::MissingField("source repo".to_string()))?;

    Ok(SourceConfig {
        kind,
        owner: string_prop(node, "owner"),
        repo,
        branch: string_prop(node, "branch").unwrap_or_else(|| "master".to_string()),
        connection_id: string_prop(node, "connection-id"),
        region: string_prop(node, "region"),
        account: string_prop(node, "account"),
    })
}

/// Lists given in the block replace the defaults; omitted ones are kept.
fn merge_step(node: &KdlNode, step: &mut StepCommands) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    let mut install = Vec::new();
    let mut run = Vec::new();
    let mut files = Vec::new();
    for child in children.nodes() {
        match child.name().value() {
            "install" => install.push(required_string_arg(child, "install command")?),
            "run" => run.push(required_string_arg(child, "run command")?),
            "file" => files.push(required_string_arg(child, "file pattern")?),
            "base-directory" => step.base_directory = first_string_arg(child),
            _ => {}
        }
    }

    if !install.is_empty() {
        step.install = install;
    }
    if !run.is_empty() {
        step.run = run;
    }
    if !files.is_empty() {
        step.files = files;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let result = load_orchestrator_config(Path::new("does-not-exist/shipyard.kdl"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_parse_minimal_config() {
        let kdl = r#"
            pipeline "CicdPipelineDemo"
            source "connection" owner="cdk-entest" repo="cicd-integration-test" connection-id="abc" region="us-east-1" account="111111111111"
        "#;

        let config = parse_orchestrator_config(kdl).unwrap();
        assert_eq!(config.pipeline_name, "CicdPipelineDemo");
        assert_eq!(config.source.branch, "master");
        assert_eq!(config.environments, EnvironmentsConfig::default());
        assert!(config.destroy_artifacts);
        assert_eq!(
            config.source.connection_arn().unwrap(),
            "arn:aws:codestar-connections:us-east-1:111111111111:connection/abc"
        );
    }

    #[test]
    fn test_step_overrides() {
        let kdl = r#"
            pipeline "demo" artifacts="retain"
            source "codecommit" repository="SwinDevOpsDemoRepo"
            build-image "aws/codebuild/standard:7.0"
            environments preprod="Staging" prod="Live"
            unittest {
                run "python -m pytest -s -v test/fhr_unittest.py"
            }
        "#;

        let config = parse_orchestrator_config(kdl).unwrap();
        assert!(!config.destroy_artifacts);
        assert_eq!(config.source.kind, SourceKind::CodeCommit);
        assert_eq!(config.build_image, "aws/codebuild/standard:7.0");
        assert_eq!(config.environments.preprod, "Staging");
        assert_eq!(config.unittest.run, ["python -m pytest -s -v test/fhr_unittest.py"]);
        // install commands were not overridden
        assert_eq!(config.unittest.install.len(), 2);
        assert_eq!(config.template.base_directory.as_deref(), Some("dist"));
    }

    #[test]
    fn test_missing_source() {
        let result = parse_orchestrator_config(r#"pipeline "demo""#);
        assert!(matches!(result, Err(ConfigError::MissingField(f)) if f == "source"));
    }

    #[test]
    fn test_same_labels_rejected() {
        let kdl = r#"
            pipeline "demo"
            source "codecommit" repository="repo"
            environments preprod="Prod" prod="Prod"
        "#;
        assert!(matches!(
            parse_orchestrator_config(kdl),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_connection_arn_passthrough_and_override() {
        let source = SourceConfig::connection(
            "owner",
            "repo",
            "arn:aws:codestar-connections:eu-west-1:222222222222:connection/xyz",
        );
        assert!(source.connection_arn().unwrap().ends_with("connection/xyz"));

        let config = OrchestratorConfig::new("demo", source).with_connection_id("other");
        assert!(matches!(
            config.source.connection_arn(),
            Err(ConfigError::MissingField(_))
        ));
    }
}
