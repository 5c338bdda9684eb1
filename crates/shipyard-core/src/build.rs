//! Build step definitions.
//!
//! A build step is one isolated build environment: an image, the install and
//! build commands run inside it, and the files captured as its output.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::iam::RoleSpec;
use crate::{Error, Result};

/// Standard managed build image.
pub const STANDARD_IMAGE: &str = "aws/codebuild/standard:5.0";

/// Immutable description of a build environment and its commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
    name: String,
    image: String,
    install: Vec<String>,
    build: Vec<String>,
    outputs: OutputSpec,
    role: Option<RoleSpec>,
    timeout_minutes: Option<u32>,
}

/// Files captured from the build environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Directory the file patterns are relative to.
    pub base_directory: Option<String>,
    /// Glob patterns. Empty means nothing is captured.
    pub files: Vec<String>,
}

impl OutputSpec {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl BuildStep {
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> BuildStepBuilder {
        BuildStepBuilder {
            step: BuildStep {
                name: name.into(),
                image: image.into(),
                install: Vec::new(),
                build: Vec::new(),
                outputs: OutputSpec::default(),
                role: None,
                timeout_minutes: None,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn install_commands(&self) -> &[String] {
        &self.install
    }

    pub fn build_commands(&self) -> &[String] {
        &self.build
    }

    pub fn outputs(&self) -> &OutputSpec {
        &self.outputs
    }

    pub fn role(&self) -> Option<&RoleSpec> {
        self.role.as_ref()
    }

    pub fn timeout_minutes(&self) -> Option<u32> {
        self.timeout_minutes
    }

    /// Render the step as a buildspec document.
    pub fn to_buildspec(&self) -> Value {
        let mut phases = Map::new();
        if !self.install.is_empty() {
            phases.insert("install".into(), json!({ "commands": self.install }));
        }
        phases.insert("build".into(), json!({ "commands": self.build }));

        let mut artifacts = Map::new();
        if let Some(dir) = &self.outputs.base_directory {
            artifacts.insert("base-directory".into(), json!(dir));
        }
        if !self.outputs.files.is_empty() {
            artifacts.insert("files".into(), json!(self.outputs.files));
        }

        json!({
            "version": "0.2",
            "phases": phases,
            "artifacts": artifacts,
        })
    }
}

/// Builder for [`BuildStep`].
pub struct BuildStepBuilder {
    step: BuildStep,
}

impl BuildStepBuilder {
    pub fn install(mut self, command: impl Into<String>) -> Self {
        self.step.install.push(command.into());
        self
    }

    pub fn run(mut self, command: impl Into<String>) -> Self {
        self.step.build.push(command.into());
        self
    }

    pub fn base_directory(mut self, dir: impl Into<String>) -> Self {
        self.step.outputs.base_directory = Some(dir.into());
        self
    }

    pub fn file(mut self, pattern: impl Into<String>) -> Self {
        self.step.outputs.files.push(pattern.into());
        self
    }

    pub fn role(mut self, role: RoleSpec) -> Self {
        self.step.role = Some(role);
        self
    }

    pub fn timeout_minutes(mut self, minutes: u32) -> Self {
        self.step.timeout_minutes = Some(minutes);
        self
    }

    pub fn build(self) -> Result<BuildStep> {
        if self.step.image.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "build step '{}' has no image",
                self.step.name
            )));
        }
        if self.step.build.is_empty() {
            return Err(Error::NoBuildCommands(self.step.name));
        }
        Ok(self.step)
    }
}
