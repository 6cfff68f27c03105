pub mod sources;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rulewatch_core::config::{EngineConfig, Layout, WorkflowLogConfig};
use serde::{Deserialize, Serialize};

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// When false the daemon refuses to start.
    pub enabled: bool,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub workflow_log: WorkflowLogConfig,
    pub supervisor: SupervisorConfig,
    pub access: AccessConfig,
    /// Static command registry, keyed by the name rules refer to.
    pub commands: BTreeMap<String, CommandConfig>,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// On-disk layout shared by every tenant supervisor.
    pub fn layout(&self) -> Layout {
        let layout = Layout::new(self.paths.tenant_home.clone(), self.paths.files_home.clone())
            .with_rule_filename(self.paths.rule_filename.clone());
        match &self.paths.writable_home {
            Some(writable) => layout.with_writable_home(writable.clone()),
            None => layout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Per-tenant metadata: rule files, caches, workflow logs.
    pub tenant_home: PathBuf,
    /// Per-tenant data roots.
    pub files_home: PathBuf,
    /// Optional writable overlay of `files_home`.
    pub writable_home: Option<PathBuf>,
    pub rule_filename: String,
    /// Directory of `<pattern_id>.json` workflow pattern records.
    pub patterns_home: Option<PathBuf>,
    /// Spool the local job submitter copies filled job files into.
    pub job_spool: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long the parent waits for a child after forwarding SIGINT.
    pub child_shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            child_shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessConfig {
    pub allow_all: bool,
}

/// One entry of the static command registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandConfig {
    pub program: PathBuf,
    /// Backend variable names positional arguments are mapped onto.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
