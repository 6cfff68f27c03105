use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error at {path}: {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid target pattern {pattern}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unsupported command: {0}")]
    UnknownCommand(String),

    #[error("Job submission failed: {0}")]
    Submit(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Workflow pattern not found: {0}")]
    PatternNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::PathIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
