//! Per-tenant, size-rotated workflow log.
//!
//! These are the user-facing lines rule authors read: skips, settle waits,
//! expanded arguments, submissions, command results. Writes run on the
//! blocking pool; failures are reported through `tracing` and never reach
//! the caller.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::warn;

use crate::config::{Layout, WorkflowLogConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkflowLevel {
    Info,
    Warning,
    Error,
}

impl WorkflowLevel {
    fn as_str(&self) -> &'static str {
        match self {
            WorkflowLevel::Info => "INFO",
            WorkflowLevel::Warning => "WARNING",
            WorkflowLevel::Error => "ERROR",
        }
    }
}

pub struct WorkflowLog {
    layout: Arc<Layout>,
    config: WorkflowLogConfig,
    write_lock: Arc<Mutex<()>>,
}

impl fmt::Debug for WorkflowLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowLog")
            .field("config", &self.config)
            .finish()
    }
}

impl WorkflowLog {
    pub fn new(layout: Arc<Layout>, config: WorkflowLogConfig) -> Self {
        Self {
            layout,
            config,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn info(&self, tenant: &str, message: impl AsRef<str>) {
        self.write(tenant, WorkflowLevel::Info, message.as_ref()).await;
    }

    pub async fn warn(&self, tenant: &str, message: impl AsRef<str>) {
        self.write(tenant, WorkflowLevel::Warning, message.as_ref()).await;
    }

    pub async fn error(&self, tenant: &str, message: impl AsRef<str>) {
        self.write(tenant, WorkflowLevel::Error, message.as_ref()).await;
    }

    pub fn path_for(&self, tenant: &str) -> PathBuf {
        self.layout.workflow_log_file(tenant)
    }

    pub async fn write(&self, tenant: &str, level: WorkflowLevel, message: &str) {
        let path = self.path_for(tenant);
        let line = format!(
            "{} {} {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level.as_str(),
            message
        );
        let lock = Arc::clone(&self.write_lock);
        let config = self.config;
        let target = path.clone();
        let written = tokio::task::spawn_blocking(move || {
            let _guard = lock.lock();
            append(&target, line.as_bytes(), config)
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(target: "rulewatch::actions", tenant, path = %path.display(), error = %err, "failed to write workflow log");
            }
            Err(err) => {
                warn!(target: "rulewatch::actions", tenant, error = %err, "workflow log writer failed");
            }
        }
    }
}

fn append(path: &Path, line: &[u8], config: WorkflowLogConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let current = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if config.max_bytes > 0 && current > 0 && current + line.len() as u64 > config.max_bytes {
        rotate(path, config.backups)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line)
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// Shift `path.N` to `path.N+1`, dropping the oldest, then move `path` to
/// `path.1`. Without backups the file is truncated.
fn rotate(path: &Path, backups: usize) -> io::Result<()> {
    if backups == 0 {
        return fs::File::create(path).map(|_| ());
    }
    let oldest = backup_path(path, backups);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for index in (1..backups).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            fs::rename(&from, backup_path(path, index + 1))?;
        }
    }
    fs::rename(path, backup_path(path, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[tokio::test]
    async fn appends_level_tagged_lines() {
        let tmp = tempdir().unwrap();
        let layout = Arc::new(Layout::new(tmp.path().join("meta"), tmp.path().join("files")));
        let log = WorkflowLog::new(layout, WorkflowLogConfig::default());
        log.info("alpha", "handle command for created data/a.csv").await;
        log.error("alpha", "failed to run command").await;

        let text = fs::read_to_string(log.path_for("alpha")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" INFO handle command"));
        assert!(lines[1].contains(" ERROR failed"));
    }

    #[tokio::test]
    async fn rotates_when_size_exceeded() {
        let tmp = tempdir().unwrap();
        let layout = Arc::new(Layout::new(tmp.path().join("meta"), tmp.path().join("files")));
        let log = WorkflowLog::new(
            layout,
            WorkflowLogConfig {
                max_bytes: 64,
                backups: 1,
            },
        );
        for i in 0..4 {
            log.info("alpha", format!("message number {i} padded to be long")).await;
        }
        let path = log.path_for("alpha");
        assert!(backup_path(&path, 1).exists());
        assert!(!backup_path(&path, 2).exists());
        let current = fs::read_to_string(&path).unwrap();
        assert!(current.contains("message number 3"));
    }
}
