//! Interfaces to the services the engine drives but does not implement.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Acknowledgement of an accepted job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub message: String,
}

/// Queues a filled job description on behalf of `owner`.
///
/// A rejected submission is reported as an error carrying the backend's
/// message.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, job_file: &Path, owner: &str, tenant: &str) -> Result<SubmitReceipt>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }
}

/// Runs a named backend operation on behalf of `owner`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, args: &[String], owner: &str, tenant: &str) -> Result<CommandOutput>;
}

/// Decides whether `owner` may act within `tenant`. Potentially expensive.
#[async_trait]
pub trait AccessCheck: Send + Sync {
    async fn has_access(&self, owner: &str, tenant: &str) -> bool;
}

/// Inclusive linear range swept by a workflow pattern.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

/// Workflow pattern record referenced by submit rules.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPattern {
    pub persistence_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub trigger_recipes: serde_json::Value,
    #[serde(default)]
    pub parameterize_over: BTreeMap<String, ParamRange>,
}

#[async_trait]
pub trait PatternLookup: Send + Sync {
    async fn get_pattern(&self, pattern_id: &str) -> Result<Option<WorkflowPattern>>;
}

/// The collaborators one supervisor dispatches to.
#[derive(Clone)]
pub struct Collaborators {
    pub submitter: Arc<dyn JobSubmitter>,
    pub commands: Arc<dyn CommandRunner>,
    pub access: Arc<dyn AccessCheck>,
    pub patterns: Arc<dyn PatternLookup>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
