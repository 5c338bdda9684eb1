//! Core plan model for Shipyard deployment pipelines.
//!
//! This crate contains:
//! - Build step, stage, action and artifact definitions
//! - Plan-level structural validation
//! - Application deployment units (per-environment resources)
//! - IAM role declarations for build steps
//! - The execution engine seam and per-run state machine

pub mod application;
pub mod artifact;
pub mod build;
pub mod engine;
pub mod error;
pub mod iam;
pub mod id;
pub mod pipeline;
pub mod run;

pub use error::{Error, Result};
pub use id::RunId;
