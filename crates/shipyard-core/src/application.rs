//! Application deployment units.
//!
//! A deployment unit is the application's own stack for one environment:
//! an HTTP-triggered function behind a REST route, plus the output carrying
//! the endpoint's base address. Every name is derived from the environment
//! label so that PreProd and Prod never collide.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeSet;

use crate::{Error, Result};

/// A deployment destination, e.g. `PreProd` or `Prod`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentTarget(String);

impl EnvironmentTarget {
    pub fn new(label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidInput(format!(
                "environment label '{}' must be non-empty and alphanumeric",
                label
            )));
        }
        Ok(Self(label))
    }

    pub fn label(&self) -> &str {
        &self.0
    }

    pub fn stack_name(&self) -> String {
        format!("{}ApplicationStack", self.0)
    }

    pub fn function_name(&self) -> String {
        format!("HelloPipeline{}", self.0)
    }

    pub fn api_name(&self) -> String {
        format!("ApiGwDemo{}", self.0)
    }

    /// Output key and export name of the endpoint address.
    pub fn url_output(&self) -> String {
        format!("Url{}", self.0)
    }

    /// File name of the synthesized stack template.
    pub fn template_file(&self) -> String {
        format!("{}.template.json", self.stack_name())
    }
}

impl std::fmt::Display for EnvironmentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The compute function serving the route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub timeout_seconds: u32,
    /// Path of the handler source, inlined into the template.
    pub code_path: String,
}

/// REST API exposing one resource and method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpApiSpec {
    pub name: String,
    pub resource: String,
    pub method: String,
}

/// A named stack output that other stacks and the pipeline can look up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub export_name: String,
    pub description: String,
}

/// The application's resources for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDeploymentUnit {
    target: EnvironmentTarget,
    stack_name: String,
    function: FunctionSpec,
    api: HttpApiSpec,
    url: StackOutput,
}

impl ApplicationDeploymentUnit {
    pub fn new(label: &str) -> Result<Self> {
        Ok(Self::for_target(EnvironmentTarget::new(label)?))
    }

    pub fn for_target(target: EnvironmentTarget) -> Self {
        let url_output = target.url_output();
        Self {
            stack_name: target.stack_name(),
            function: FunctionSpec {
                name: target.function_name(),
                runtime: "python3.8".to_string(),
                handler: "index.handler".to_string(),
                timeout_seconds: 10,
                code_path: "lambda/index.py".to_string(),
            },
            api: HttpApiSpec {
                name: target.api_name(),
                resource: "book".to_string(),
                method: "GET".to_string(),
            },
            url: StackOutput {
                key: url_output.clone(),
                export_name: url_output,
                description: "api url".to_string(),
            },
            target,
        }
    }

    /// Replace the default `GET /book` route.
    pub fn with_route(mut self, resource: impl Into<String>, method: impl Into<String>) -> Self {
        self.api.resource = resource.into();
        self.api.method = method.into().to_uppercase();
        self
    }

    pub fn target(&self) -> &EnvironmentTarget {
        &self.target
    }

    pub fn stack_name(&self) -> &str {
        &self.stack_name
    }

    pub fn function(&self) -> &FunctionSpec {
        &self.function
    }

    pub fn api(&self) -> &HttpApiSpec {
        &self.api
    }

    pub fn url_output(&self) -> &StackOutput {
        &self.url
    }

    /// Every externally visible name this unit creates.
    pub fn resource_names(&self) -> BTreeSet<String> {
        [
            self.stack_name.clone(),
            self.function.name.clone(),
            self.api.name.clone(),
            self.url.key.clone(),
            self.url.export_name.clone(),
        ]
        .into_iter()
        .collect()
    }

    /// Render the stack as a template document.
    pub fn to_template(&self) -> Value {
        let method_id = format!(
            "ApiGwDemo{}{}",
            capitalize(&self.api.resource),
            capitalize(&self.api.method.to_lowercase())
        );
        let resource_id = format!("ApiGwDemo{}", capitalize(&self.api.resource));

        json!({
            "Description": format!("{} application ({})", self.target, self.stack_name),
            "Resources": {
                "Lambda": {
                    "Type": "AWS::Lambda::Function",
                    "Properties": {
                        "FunctionName": self.function.name,
                        "Runtime": self.function.runtime,
                        "Handler": self.function.handler,
                        "Timeout": self.function.timeout_seconds,
                        "Code": { "ZipFile": { "Fn::FileContents": self.function.code_path } },
                    },
                },
                "ApiGwDemo": {
                    "Type": "AWS::ApiGateway::RestApi",
                    "Properties": { "Name": self.api.name },
                },
                resource_id.clone(): {
                    "Type": "AWS::ApiGateway::Resource",
                    "Properties": {
                        "RestApiId": { "Ref": "ApiGwDemo" },
                        "ParentId": { "Fn::GetAtt": ["ApiGwDemo", "RootResourceId"] },
                        "PathPart": self.api.resource,
                    },
                },
                method_id: {
                    "Type": "AWS::ApiGateway::Method",
                    "Properties": {
                        "RestApiId": { "Ref": "ApiGwDemo" },
                        "ResourceId": { "Ref": resource_id },
                        "HttpMethod": self.api.method,
                        "AuthorizationType": "NONE",
                        "Integration": {
                            "Type": "AWS_PROXY",
                            "IntegrationHttpMethod": "POST",
                            "Uri": { "Fn::Sub": "arn:aws:apigateway:${AWS::Region}:lambda:path/2015-03-31/functions/${Lambda.Arn}/invocations" },
                        },
                    },
                },
            },
            "Outputs": {
                self.url.key.clone(): {
                    "Description": self.url.description,
                    "Export": { "Name": self.url.export_name },
                    "Value": { "Fn::Sub": "https://${ApiGwDemo}.execute-api.${AWS::Region}.amazonaws.com/prod/" },
                },
            },
        })
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_derive_from_label() {
        let unit = ApplicationDeploymentUnit::new("PreProd").unwrap();
        assert_eq!(unit.stack_name(), "PreProdApplicationStack");
        assert_eq!(unit.function().name, "HelloPipelinePreProd");
        assert_eq!(unit.api().name, "ApiGwDemoPreProd");
        assert_eq!(unit.url_output().key, "UrlPreProd");
        assert_eq!(unit.url_output().export_name, "UrlPreProd");
        assert_eq!(
            unit.target().template_file(),
            "PreProdApplicationStack.template.json"
        );
    }

    #[test]
    fn test_environments_do_not_collide() {
        let preprod = ApplicationDeploymentUnit::new("PreProd").unwrap();
        let prod = ApplicationDeploymentUnit::new("Prod").unwrap();

        let a = preprod.resource_names();
        let b = prod.resource_names();
        assert!(!a.is_empty());
        assert!(a.is_disjoint(&b), "overlap: {:?}", a.intersection(&b).collect::<Vec<_>>());
    }

    #[test]
    fn test_invalid_labels_rejected() {
        assert!(ApplicationDeploymentUnit::new("").is_err());
        assert!(ApplicationDeploymentUnit::new("Pre Prod").is_err());
        assert!(ApplicationDeploymentUnit::new("pre-prod").is_err());
    }

    #[test]
    fn test_template_exposes_url_output() {
        let unit = ApplicationDeploymentUnit::new("Prod").unwrap();
        let template = unit.to_template();

        assert_eq!(
            template["Resources"]["Lambda"]["Properties"]["FunctionName"],
            "HelloPipelineProd"
        );
        assert_eq!(
            template["Resources"]["ApiGwDemoBookGet"]["Properties"]["HttpMethod"],
            "GET"
        );
        assert_eq!(template["Outputs"]["UrlProd"]["Export"]["Name"], "UrlProd");
    }

    #[test]
    fn test_custom_route() {
        let unit = ApplicationDeploymentUnit::new("Prod")
            .unwrap()
            .with_route("orders", "post");
        let template = unit.to_template();
        assert_eq!(
            template["Resources"]["ApiGwDemoOrdersPost"]["Properties"]["HttpMethod"],
            "POST"
        );
    }
}
