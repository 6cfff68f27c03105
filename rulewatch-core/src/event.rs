use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of filesystem change a rule can react to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Created, ChangeKind::Modified, ChangeKind::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "deleted" => Ok(ChangeKind::Deleted),
            other => Err(format!("unknown change kind '{other}'")),
        }
    }
}

/// One ancestor of a synthetic event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainLink {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl ChainLink {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for ChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : {}", self.path.display(), self.kind)
    }
}

/// A filesystem change flowing through the event core.
///
/// Real events come from the watcher; synthetic events come from `trigger-*`
/// actions and carry the chain of events that produced them, ending with
/// themselves.
#[derive(Clone, Debug, PartialEq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_directory: bool,
    pub observed_at: DateTime<Utc>,
    pub synthetic: bool,
    pub chain: Vec<ChainLink>,
}

impl FsEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind, is_directory: bool) -> Self {
        Self {
            path: path.into(),
            kind,
            is_directory,
            observed_at: Utc::now(),
            synthetic: false,
            chain: Vec::new(),
        }
    }

    pub fn synthetic(
        path: impl Into<PathBuf>,
        kind: ChangeKind,
        is_directory: bool,
        chain: Vec<ChainLink>,
    ) -> Self {
        Self {
            synthetic: true,
            chain,
            ..Self::new(path, kind, is_directory)
        }
    }

    /// The chain of this event, or the event itself when it has none.
    pub fn lineage(&self) -> Vec<ChainLink> {
        if self.chain.is_empty() {
            vec![ChainLink::new(self.path.clone(), self.kind)]
        } else {
            self.chain.clone()
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Renders a chain as `a : created <-> b : created`.
pub fn format_chain(chain: &[ChainLink]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" <-> ")
}
