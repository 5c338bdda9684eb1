//! Variable interpolation for action environments.
//!
//! Supports variables like:
//! - `${pipeline.name}` - Pipeline name
//! - `${run.id}` - Run ID
//! - `${stage.name}` / `${stage.index}` - Current stage
//! - `${env.VAR_NAME}` - Environment variable of the runner
//! - `${Namespace.Var}` - Variable published by an earlier action,
//!   e.g. `${SourceVariables.CommitId}`
//! - `${name}` - Custom variable

use regex::Captures;
use shipyard_core::pipeline::VARIABLE_REGEX;
use std::collections::BTreeMap;

/// Variables available when resolving an action's environment.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub pipeline_name: String,
    pub run_id: String,
    pub stage_name: String,
    pub stage_index: usize,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Variables published by actions, keyed by namespace
    pub namespaces: BTreeMap<String, BTreeMap<String, String>>,
    /// Custom variables defined by the caller
    pub custom: BTreeMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `variables` under `namespace`, replacing earlier values.
    pub fn publish(&mut self, namespace: &str, variables: BTreeMap<String, String>) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .extend(variables);
    }

    pub fn enter_stage(&mut self, name: &str, index: usize) {
        self.stage_name = name.to_string();
        self.stage_index = index;
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["pipeline", "name"] => Some(self.pipeline_name.clone()),
            ["run", "id"] => Some(self.run_id.clone()),
            ["stage", "name"] => Some(self.stage_name.clone()),
            ["stage", "index"] => Some(self.stage_index.to_string()),
            ["env", name] => self.env.get(*name).cloned(),
            [namespace, name] => self
                .namespaces
                .get(*namespace)
                .and_then(|vars| vars.get(*name))
                .cloned(),
            [name] => self.custom.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left as
    /// written.
    pub fn interpolate(&self, input: &str) -> String {
        VARIABLE_REGEX
            .replace_all(input, |caps: &Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Variable names in `input` that cannot be resolved yet.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VARIABLE_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext. Pipeline, run and stage variables
/// are filled in by the runner.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(namespace: &str, key: &str, value: &str) -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.publish(
            namespace,
            BTreeMap::from([(key.to_string(), value.to_string())]),
        );
        ctx
    }

    #[test]
    fn test_namespace_interpolation() {
        let ctx = published("SourceVariables", "CommitId", "9f1c2e7");

        let result = ctx.interpolate("commit=${SourceVariables.CommitId}");
        assert_eq!(result, "commit=9f1c2e7");
    }

    #[test]
    fn test_builtin_variables() {
        let mut ctx = VariableContext::new();
        ctx.pipeline_name = "CicdPipelineDemo".to_string();
        ctx.run_id = "run-1".to_string();
        ctx.enter_stage("Unittest", 1);

        let result = ctx.interpolate("${pipeline.name}/${run.id}/${stage.name}#${stage.index}");
        assert_eq!(result, "CicdPipelineDemo/run-1/Unittest#1");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("REGION", "us-east-1")
            .build();
        assert_eq!(ctx.interpolate("${env.REGION}"), "us-east-1");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${Missing.Var}");
        assert_eq!(result, "Unknown: ${Missing.Var}");
        assert_eq!(ctx.unresolved("${Missing.Var} ${x}"), vec!["Missing.Var", "x"]);
    }

    #[test]
    fn test_publish_merges() {
        let mut ctx = VariableContext::new();
        ctx.publish(
            "SourceVariables",
            BTreeMap::from([("CommitId".to_string(), "a".to_string())]),
        );
        ctx.publish(
            "SourceVariables",
            BTreeMap::from([("BranchName".to_string(), "master".to_string())]),
        );
        assert_eq!(ctx.resolve("SourceVariables.CommitId").as_deref(), Some("a"));
        assert_eq!(
            ctx.resolve("SourceVariables.BranchName").as_deref(),
            Some("master")
        );
    }

    #[test]
    fn test_interpolate_map() {
        let ctx = VariableContextBuilder::new()
            .with_custom("version", "1.2.3")
            .build();
        let map = BTreeMap::from([("VERSION".to_string(), "v${version}".to_string())]);
        let result = ctx.interpolate_map(&map);
        assert_eq!(result["VERSION"], "v1.2.3");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = published("SourceVariables", "CommitId", "abc123");

        let result = ctx.interpolate(r#"{"sha": "${SourceVariables.CommitId}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
