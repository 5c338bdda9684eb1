//! Artifacts handed from one stage to a later one.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;

use crate::pipeline::Stage;
use crate::{Error, Result};

/// Name of an artifact, unique within a plan.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct ArtifactName(String);

impl ArtifactName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("artifact name is empty".to_string()));
        }
        if name.contains("::") {
            return Err(Error::InvalidInput(format!(
                "artifact name '{}' must not contain '::'",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reference a file inside this artifact.
    pub fn at_path(&self, file: impl Into<String>) -> ArtifactPath {
        ArtifactPath {
            artifact: self.clone(),
            file: file.into(),
        }
    }
}

impl Borrow<str> for ArtifactName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A file inside an artifact, written `artifact::file`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[display("{artifact}::{file}")]
pub struct ArtifactPath {
    pub artifact: ArtifactName,
    pub file: String,
}

impl std::str::FromStr for ArtifactPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (artifact, file) = s.split_once("::").ok_or_else(|| {
            Error::InvalidInput(format!("'{}' is not of the form artifact::file", s))
        })?;
        if file.is_empty() {
            return Err(Error::InvalidInput(format!("'{}' names no file", s)));
        }
        Ok(ArtifactName::new(artifact)?.at_path(file))
    }
}

/// Where an action sits in a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLocation {
    pub stage_index: usize,
    pub stage: String,
    pub action: String,
}

impl std::fmt::Display for ActionLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stage, self.action)
    }
}

/// One producer-to-consumer handoff of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBinding {
    artifact: ArtifactName,
    producer: ActionLocation,
    consumer: ActionLocation,
}

impl ArtifactBinding {
    /// Bind `artifact` from `producer` to `consumer`.
    ///
    /// Artifacts only flow forward (or between actions of one stage), so a
    /// producer in a later stage than its consumer is rejected, as is an
    /// action consuming its own output.
    pub fn new(
        artifact: ArtifactName,
        producer: ActionLocation,
        consumer: ActionLocation,
    ) -> Result<Self> {
        if producer == consumer {
            return Err(Error::SelfReference {
                artifact: artifact.to_string(),
                action: consumer.to_string(),
            });
        }
        if producer.stage_index > consumer.stage_index {
            return Err(Error::ForwardReference {
                artifact: artifact.to_string(),
                producer: producer.to_string(),
                producer_stage: producer.stage_index,
                consumer: consumer.to_string(),
                consumer_stage: consumer.stage_index,
            });
        }
        Ok(Self {
            artifact,
            producer,
            consumer,
        })
    }

    pub fn artifact(&self) -> &ArtifactName {
        &self.artifact
    }

    pub fn producer(&self) -> &ActionLocation {
        &self.producer
    }

    pub fn consumer(&self) -> &ActionLocation {
        &self.consumer
    }
}

/// Every artifact in a plan with its single producer and its consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactGraph {
    producers: BTreeMap<ArtifactName, ActionLocation>,
    bindings: Vec<ArtifactBinding>,
}

impl ArtifactGraph {
    /// Resolve all artifact inputs of `stages` against their producers.
    pub fn from_stages(stages: &[Stage]) -> Result<Self> {
        let mut producers: BTreeMap<ArtifactName, ActionLocation> = BTreeMap::new();

        for (stage_index, stage) in stages.iter().enumerate() {
            for action in stage.actions() {
                for output in action.outputs() {
                    let location = ActionLocation {
                        stage_index,
                        stage: stage.name().to_string(),
                        action: action.name().to_string(),
                    };
                    if let Some(first) = producers.get(output) {
                        return Err(Error::DuplicateArtifact {
                            artifact: output.to_string(),
                            first: first.to_string(),
                            second: location.to_string(),
                        });
                    }
                    producers.insert(output.clone(), location);
                }
            }
        }

        let mut bindings = Vec::new();
        for (stage_index, stage) in stages.iter().enumerate() {
            for action in stage.actions() {
                let consumer = ActionLocation {
                    stage_index,
                    stage: stage.name().to_string(),
                    action: action.name().to_string(),
                };
                for input in action.inputs() {
                    let producer =
                        producers
                            .get(input)
                            .cloned()
                            .ok_or_else(|| Error::MissingArtifact {
                                artifact: input.to_string(),
                                consumer: consumer.to_string(),
                            })?;
                    bindings.push(ArtifactBinding::new(
                        input.clone(),
                        producer,
                        consumer.clone(),
                    )?);
                }
            }
        }

        Ok(Self {
            producers,
            bindings,
        })
    }

    pub fn producer(&self, artifact: &str) -> Option<&ActionLocation> {
        self.producers.get(artifact)
    }

    pub fn consumers<'a>(&'a self, artifact: &'a str) -> impl Iterator<Item = &'a ActionLocation> {
        self.bindings
            .iter()
            .filter(move |b| b.artifact.as_str() == artifact)
            .map(|b| &b.consumer)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactName> {
        self.producers.keys()
    }

    pub fn bindings(&self) -> &[ArtifactBinding] {
        &self.bindings
    }
}
