//! Free-form pipeline declarations.
//!
//! ```kdl
//! pipeline "demo" artifacts="destroy"
//!
//! stage "Source" {
//!     source "Fetch" output="source" namespace="SourceVariables" {
//!         codecommit repository="demo" branch="master"
//!     }
//! }
//!
//! stage "Build" {
//!     build "Compile" input="source" output="bin" {
//!         image "aws/codebuild/standard:5.0"
//!         run "make"
//!         env {
//!             COMMIT "${SourceVariables.CommitId}"
//!         }
//!     }
//! }
//! ```

use crate::kdl_util::{
    bool_prop, first_string_arg, required_string_arg, string_list_prop, string_map, string_prop,
    u32_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use shipyard_core::artifact::{ArtifactName, ArtifactPath};
use shipyard_core::build::{BuildStep, STANDARD_IMAGE};
use shipyard_core::iam::{BUILD_SERVICE_PRINCIPAL, PolicySpec, RoleSpec};
use shipyard_core::pipeline::{
    Action, BuildAction, DeployAction, EndpointLookup, PipelineDefinition, RemovalPolicy,
    SourceAction, SourceProvider,
};

/// Parse and validate a pipeline declaration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut removal = RemovalPolicy::Retain;
    let mut builder_stages = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = required_string_arg(node, "pipeline name")?;
                if let Some(policy) = string_prop(node, "artifacts") {
                    removal = parse_removal(&policy)?;
                }
            }
            "stage" => {
                builder_stages.push(parse_stage(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    let mut builder = PipelineDefinition::builder(name).artifact_removal(removal);
    for (stage, actions) in builder_stages {
        builder = builder.stage(stage, actions);
    }
    Ok(builder.build()?)
}

fn parse_removal(value: &str) -> ConfigResult<RemovalPolicy> {
    match value {
        "retain" => Ok(RemovalPolicy::Retain),
        "destroy" => Ok(RemovalPolicy::Destroy),
        other => Err(ConfigError::InvalidValue {
            field: "artifacts".to_string(),
            message: format!("expected 'retain' or 'destroy', got '{}'", other),
        }),
    }
}

fn parse_stage(node: &KdlNode) -> ConfigResult<(String, Vec<Action>)> {
    let name = required_string_arg(node, "stage name")?;

    let mut actions = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let action = match child.name().value() {
                "source" => parse_source(child)?,
                "build" => Action::build(action_name(child)?, parse_build(child)?),
                "test" => Action::test(action_name(child)?, parse_build(child)?),
                "deploy" => parse_deploy(child)?,
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("stage '{}'", name),
                        message: format!("unknown action type '{}'", other),
                    });
                }
            };
            actions.push(with_common(child, action));
        }
    }

    Ok((name, actions))
}

fn action_name(node: &KdlNode) -> ConfigResult<String> {
    required_string_arg(node, &format!("{} action name", node.name().value()))
}

/// Properties and children shared by every action type.
fn with_common(node: &KdlNode, mut action: Action) -> Action {
    for stage in string_list_prop(node, "after") {
        action = action.after(stage);
    }
    if let Some(ns) = string_prop(node, "namespace") {
        action = action.with_namespace(ns);
    }
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "env" {
                for (key, value) in string_map(child) {
                    action = action.with_env(key, value);
                }
            }
        }
    }
    action
}

fn artifact_prop(node: &KdlNode, prop: &str) -> ConfigResult<ArtifactName> {
    let value = string_prop(node, prop).ok_or_else(|| {
        ConfigError::MissingField(format!("{} of '{}'", prop, node.name().value()))
    })?;
    Ok(ArtifactName::new(value)?)
}

fn parse_source(node: &KdlNode) -> ConfigResult<Action> {
    let name = action_name(node)?;
    let output = artifact_prop(node, "output")?;

    let provider_node = node
        .children()
        .and_then(|c| {
            c.nodes()
                .iter()
                .find(|n| matches!(n.name().value(), "connection" | "codecommit"))
        })
        .ok_or_else(|| ConfigError::MissingField(format!("provider of source '{}'", name)))?;

    let required = |prop: &str| {
        string_prop(provider_node, prop).ok_or_else(|| {
            ConfigError::MissingField(format!("{} of source '{}'", prop, name))
        })
    };

    let branch = string_prop(provider_node, "branch").unwrap_or_else(|| "master".to_string());
    let provider = match provider_node.name().value() {
        "connection" => SourceProvider::Connection {
            owner: required("owner")?,
            repo: required("repo")?,
            branch,
            connection_arn: required("arn")?,
        },
        _ => SourceProvider::CodeCommit {
            repository: required("repository")?,
            branch,
        },
    };

    Ok(Action::source(name, SourceAction::new(provider, output)))
}

fn parse_build(node: &KdlNode) -> ConfigResult<BuildAction> {
    let name = action_name(node)?;
    let inputs = string_list_prop(node, "input");
    let outputs = string_list_prop(node, "output");

    let mut image = STANDARD_IMAGE.to_string();
    let mut lookups = Vec::new();
    let mut install = Vec::new();
    let mut run = Vec::new();
    let mut base_directory = None;
    let mut files = Vec::new();
    let mut role = None;
    let mut timeout = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => image = required_string_arg(child, "image")?,
                "install" => install.push(required_string_arg(child, "install command")?),
                "run" => run.push(required_string_arg(child, "run command")?),
                "base-directory" => base_directory = first_string_arg(child),
                "file" => files.push(required_string_arg(child, "file pattern")?),
                "timeout" => timeout = u32_prop(child, "minutes")?,
                "role" => role = Some(parse_role(child)?),
                "lookup" => lookups.push(EndpointLookup::new(
                    string_prop(child, "stack")
                        .ok_or_else(|| ConfigError::MissingField("lookup stack".to_string()))?,
                    string_prop(child, "output")
                        .ok_or_else(|| ConfigError::MissingField("lookup output".to_string()))?,
                    string_prop(child, "env")
                        .ok_or_else(|| ConfigError::MissingField("lookup env".to_string()))?,
                )),
                _ => {}
            }
        }
    }

    let mut builder = BuildStep::builder(name.clone(), image);
    for cmd in install {
        builder = builder.install(cmd);
    }
    for cmd in run {
        builder = builder.run(cmd);
    }
    if let Some(dir) = base_directory {
        builder = builder.base_directory(dir);
    }
    for pattern in files {
        builder = builder.file(pattern);
    }
    if let Some(role) = role {
        builder = builder.role(role);
    }
    if let Some(minutes) = timeout {
        builder = builder.timeout_minutes(minutes);
    }
    let step = builder.build()?;

    let mut inputs = inputs.into_iter();
    let primary = inputs
        .next()
        .ok_or_else(|| ConfigError::MissingField(format!("input of '{}'", name)))?;

    let mut action = BuildAction::new(step, ArtifactName::new(primary)?);
    for extra in inputs {
        action = action.with_input(ArtifactName::new(extra)?);
    }
    for output in outputs {
        action = action.with_output(ArtifactName::new(output)?);
    }
    for lookup in lookups {
        action = action.with_lookup(lookup);
    }
    Ok(action)
}

fn parse_role(node: &KdlNode) -> ConfigResult<RoleSpec> {
    let name = required_string_arg(node, "role name")?;
    let principal =
        string_prop(node, "principal").unwrap_or_else(|| BUILD_SERVICE_PRINCIPAL.to_string());

    let mut policy = PolicySpec::new(format!("{}Policy", name));
    if let Some(children) = node.children() {
        for child in children.nodes().iter().filter(|c| c.name().value() == "allow") {
            let actions: Vec<String> = child
                .entries()
                .iter()
                .filter(|e| e.name().is_none())
                .filter_map(|e| e.value().as_string())
                .map(|s| s.to_string())
                .collect();
            let resources = string_list_prop(child, "resource");
            let resources = if resources.is_empty() {
                vec!["*".to_string()]
            } else {
                resources
            };
            policy = policy.allow(actions, resources);
        }
    }

    let role = RoleSpec::new(name, principal);
    Ok(if policy.statements.is_empty() {
        role
    } else {
        role.with_policy(policy)
    })
}

fn parse_deploy(node: &KdlNode) -> ConfigResult<Action> {
    let name = action_name(node)?;
    let template: ArtifactPath = string_prop(node, "template")
        .ok_or_else(|| ConfigError::MissingField(format!("template of '{}'", name)))?
        .parse()?;
    let stack = string_prop(node, "stack")
        .ok_or_else(|| ConfigError::MissingField(format!("stack of '{}'", name)))?;

    let mut deploy = DeployAction::new(template, stack);
    if bool_prop(node, "admin").unwrap_or(false) {
        deploy = deploy.with_admin_permissions();
    }
    Ok(Action::deploy(name, deploy))
}
