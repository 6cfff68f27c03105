//! Guard rails applied to a composed [`Config`].
//!
//! Violations that would make the daemon misbehave are errors; conditions
//! that only disable part of the functionality are warnings.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::Config;
use crate::util::normalize_log_level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint(&mut self, message: impl Into<String>, hint: impl Into<String>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("paths.{field} must be set (or RULEWATCH_{env})")]
    MissingPath { field: &'static str, env: &'static str },
    #[error("paths.tenant_home and paths.files_home must differ (both are {path})")]
    SharedHome { path: PathBuf },
    #[error("paths.rule_filename must be a plain file name, got '{value}'")]
    InvalidRuleFilename { value: String },
    #[error("engine.max_concurrent_actions must be at least 1")]
    NoActionSlots,
    #[error("engine.watch_backlog_warning must be at least 1")]
    NoWatchBacklog,
    #[error("unknown log level '{value}' (expected debug, info, warning or error)")]
    InvalidLogLevel { value: String },
}

pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();
    let paths = &config.paths;

    if paths.tenant_home.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingPath {
            field: "tenant_home",
            env: "TENANT_HOME",
        });
    }
    if paths.files_home.as_os_str().is_empty() {
        return Err(ConfigGuardRailError::MissingPath {
            field: "files_home",
            env: "FILES_HOME",
        });
    }
    if paths.tenant_home == paths.files_home {
        return Err(ConfigGuardRailError::SharedHome {
            path: paths.tenant_home.clone(),
        });
    }

    let rule_filename = paths.rule_filename.trim();
    if rule_filename.is_empty() || rule_filename.contains('/') || rule_filename == "." || rule_filename == ".." {
        return Err(ConfigGuardRailError::InvalidRuleFilename {
            value: paths.rule_filename.clone(),
        });
    }

    if config.engine.max_concurrent_actions == 0 {
        return Err(ConfigGuardRailError::NoActionSlots);
    }
    if config.engine.watch_backlog_warning == 0 {
        return Err(ConfigGuardRailError::NoWatchBacklog);
    }

    if let Some(level) = &config.logging.level
        && normalize_log_level(level).is_none()
    {
        return Err(ConfigGuardRailError::InvalidLogLevel {
            value: level.clone(),
        });
    }

    if let Some(writable) = &paths.writable_home
        && !writable.is_dir()
    {
        warnings.push_with_hint(
            format!("writable overlay {} does not exist", writable.display()),
            "Events below the overlay will not be mapped back to files_home",
        );
    }

    match &paths.patterns_home {
        None => warnings.push_with_hint(
            "No patterns_home configured; submit actions will fail",
            "Set paths.patterns_home to the directory holding <pattern_id>.json records",
        ),
        Some(dir) if !dir.is_dir() => warnings.push_with_hint(
            format!("patterns_home {} does not exist; submit actions will fail", dir.display()),
            "Create the directory or point paths.patterns_home elsewhere",
        ),
        Some(_) => {}
    }

    Ok(warnings)
}
