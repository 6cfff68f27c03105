//! Rule records, target patterns and the per-process rule map.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::event::ChangeKind;
use crate::timespec::{RateLimit, parse_rate, parse_time};

pub mod pattern;
pub mod store;

pub use pattern::{PatternMatch, TargetPattern};
pub use store::{ReloadSummary, RuleEntry, RuleMap, RuleStore, parse_rule_file};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    #[serde(rename = "submit")]
    Submit,
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "trigger-created")]
    TriggerCreated,
    #[serde(rename = "trigger-modified")]
    TriggerModified,
    #[serde(rename = "trigger-deleted")]
    TriggerDeleted,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Submit => "submit",
            RuleAction::Command => "command",
            RuleAction::TriggerCreated => "trigger-created",
            RuleAction::TriggerModified => "trigger-modified",
            RuleAction::TriggerDeleted => "trigger-deleted",
        }
    }

    /// Change kind synthesized by a `trigger-*` action.
    pub fn trigger_kind(&self) -> Option<ChangeKind> {
        match self {
            RuleAction::TriggerCreated => Some(ChangeKind::Created),
            RuleAction::TriggerModified => Some(ChangeKind::Modified),
            RuleAction::TriggerDeleted => Some(ChangeKind::Deleted),
            RuleAction::Submit | RuleAction::Command => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant-scoped binding of a path pattern and change kinds to an action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    #[serde(default, alias = "vgrid_name")]
    pub tenant: String,
    #[serde(alias = "run_as")]
    pub owner: String,
    pub path: String,
    #[serde(default)]
    pub changes: Vec<ChangeKind>,
    pub action: RuleAction,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub templates: Vec<String>,
    #[serde(default)]
    pub rate_limit: String,
    #[serde(default)]
    pub settle_time: String,
    #[serde(default = "default_match_files")]
    pub match_files: bool,
    #[serde(default)]
    pub match_dirs: bool,
    #[serde(default)]
    pub match_recursive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_vars: BTreeMap<String, String>,
}

const fn default_match_files() -> bool {
    true
}

impl Rule {
    pub fn rate(&self) -> RateLimit {
        parse_rate(&self.rate_limit)
    }

    pub fn settle(&self) -> Duration {
        parse_time(&self.settle_time)
    }

    pub fn reacts_to(&self, kind: ChangeKind) -> bool {
        self.changes.contains(&kind)
    }

    /// Structural checks a rule must pass before it is installed.
    pub fn validate(&self) -> Result<()> {
        if self.rule_id.trim().is_empty() {
            return Err(EngineError::InvalidRule("missing rule_id".into()));
        }
        if self.owner.trim().is_empty() {
            return Err(EngineError::InvalidRule(format!(
                "rule {} has no owner",
                self.rule_id
            )));
        }
        if self.path.trim().is_empty() {
            return Err(EngineError::InvalidRule(format!(
                "rule {} has an empty path",
                self.rule_id
            )));
        }
        let path = Path::new(&self.path);
        if path.is_absolute()
            || path
                .components()
                .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(EngineError::InvalidRule(format!(
                "rule {} path {} escapes the tenant root",
                self.rule_id, self.path
            )));
        }
        if self.changes.is_empty() {
            return Err(EngineError::InvalidRule(format!(
                "rule {} lists no changes",
                self.rule_id
            )));
        }
        match self.action {
            RuleAction::Command if self.arguments.is_empty() => {
                Err(EngineError::InvalidRule(format!(
                    "command rule {} has no command name",
                    self.rule_id
                )))
            }
            RuleAction::Submit if self.templates.is_empty() => {
                Err(EngineError::InvalidRule(format!(
                    "submit rule {} has no job templates",
                    self.rule_id
                )))
            }
            _ => Ok(()),
        }
    }
}
