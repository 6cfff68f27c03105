use std::collections::BTreeMap;
use std::path::PathBuf;

use rulewatch_core::config::{EngineConfig, WorkflowLogConfig};
use serde::{Deserialize, Serialize};

use crate::util::{flag_var, path_var, string_var};

use super::CommandConfig;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub paths: FilePathsConfig,
    #[serde(default)]
    pub logging: FileLoggingConfig,
    pub engine: Option<EngineConfig>,
    pub workflow_log: Option<WorkflowLogConfig>,
    #[serde(default)]
    pub supervisor: FileSupervisorConfig,
    #[serde(default)]
    pub access: FileAccessConfig,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandConfig>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePathsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_home: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_home: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writable_home: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patterns_home: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_spool: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSupervisorConfig {
    /// Humantime duration such as `"10s"` or `"1m 30s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_shutdown_grace: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAccessConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_all: Option<bool>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub enabled: Option<bool>,
    pub tenant_home: Option<PathBuf>,
    pub files_home: Option<PathBuf>,
    pub writable_home: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: path_var("RULEWATCH_CONF"),
            enabled: flag_var("RULEWATCH_ENABLED"),
            tenant_home: path_var("RULEWATCH_TENANT_HOME"),
            files_home: path_var("RULEWATCH_FILES_HOME"),
            writable_home: path_var("RULEWATCH_WRITABLE_HOME"),
            log_level: string_var("RULEWATCH_LOG_LEVEL"),
            log_file: path_var("RULEWATCH_LOG_FILE"),
        }
    }
}
