//! IAM role declarations attached to build steps.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Service principal used by build projects.
pub const BUILD_SERVICE_PRINCIPAL: &str = "codebuild.amazonaws.com";

/// A role a build step assumes while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// Role name as created in the account.
    pub role_name: String,
    /// Service principal allowed to assume the role.
    pub assumed_by: String,
    /// Inline policies attached to the role.
    pub policies: Vec<PolicySpec>,
}

/// A named inline policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub statements: Vec<PolicyStatement>,
}

/// An allow statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    pub resources: Vec<String>,
}

impl RoleSpec {
    pub fn new(role_name: impl Into<String>, assumed_by: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            assumed_by: assumed_by.into(),
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: PolicySpec) -> Self {
        self.policies.push(policy);
        self
    }

    /// Trust policy letting the principal assume this role.
    pub fn trust_document(&self) -> Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": self.assumed_by },
                "Action": "sts:AssumeRole",
            }],
        })
    }

    /// Role document with its trust policy and inline policies.
    pub fn to_document(&self) -> Value {
        let policies: Vec<Value> = self
            .policies
            .iter()
            .map(|p| json!({ "PolicyName": p.name, "PolicyDocument": p.to_document() }))
            .collect();

        json!({
            "RoleName": self.role_name,
            "AssumeRolePolicyDocument": self.trust_document(),
            "Policies": policies,
        })
    }

    /// File name the role document is written under.
    pub fn document_file(&self) -> String {
        format!("{}.role.json", self.role_name)
    }
}

impl PolicySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            statements: Vec::new(),
        }
    }

    pub fn allow<A, R>(mut self, actions: A, resources: R) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        self.statements.push(PolicyStatement {
            actions: actions.into_iter().map(Into::into).collect(),
            resources: resources.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn to_document(&self) -> Value {
        let statements: Vec<Value> = self
            .statements
            .iter()
            .map(|s| {
                json!({
                    "Effect": "Allow",
                    "Action": s.actions,
                    "Resource": s.resources,
                })
            })
            .collect();

        json!({
            "Version": "2012-10-17",
            "Statement": statements,
        })
    }
}
