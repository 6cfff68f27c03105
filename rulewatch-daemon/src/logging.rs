//! Process-wide `tracing` setup.
//!
//! Output goes to stderr or to a log file that can be reopened in place
//! after an external tool rotated it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use rulewatch_config::util::normalize_log_level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "RULEWATCH_LOG";

/// Append-mode log file whose handle can be swapped for a fresh one.
#[derive(Debug)]
pub struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

impl ReopenableFile {
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut file = self.file.lock();
        file.flush()?;
        *file = fresh;
        Ok(())
    }
}

impl Write for &ReopenableFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.lock().flush()
    }
}

#[derive(Debug, Clone)]
struct SharedLogFile(Arc<ReopenableFile>);

impl<'a> MakeWriter<'a> for SharedLogFile {
    type Writer = &'a ReopenableFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.0.as_ref()
    }
}

/// Handle kept by the signal listener to reopen the log on SIGHUP.
#[derive(Debug, Clone, Default)]
pub struct LogHandle {
    file: Option<Arc<ReopenableFile>>,
}

impl LogHandle {
    pub fn reopen(&self) -> io::Result<()> {
        match &self.file {
            Some(file) => file.reopen(),
            None => Ok(()),
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|file| file.path())
    }
}

/// Filter directive in order of precedence: `RULEWATCH_LOG`, `RUST_LOG`,
/// the command line level, the configured level, then `info`.
pub fn filter_directive(
    rulewatch_log: Option<String>,
    rust_log: Option<String>,
    cli_level: Option<&str>,
    configured_level: Option<&str>,
) -> String {
    let non_blank = |value: Option<String>| value.filter(|value| !value.trim().is_empty());
    if let Some(directive) = non_blank(rulewatch_log).or_else(|| non_blank(rust_log)) {
        return directive;
    }
    cli_level
        .or(configured_level)
        .and_then(normalize_log_level)
        .unwrap_or("info")
        .to_string()
}

/// Install the global subscriber. Call once per process.
pub fn init(
    cli_level: Option<&str>,
    configured_level: Option<&str>,
    log_file: Option<&Path>,
) -> anyhow::Result<LogHandle> {
    let directive = filter_directive(
        std::env::var(LOG_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
        cli_level,
        configured_level,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = Arc::new(
                ReopenableFile::open(path)
                    .with_context(|| format!("failed to open log file {}", path.display()))?,
            );
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(SharedLogFile(Arc::clone(&file)))
                        .with_ansi(false),
                )
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(LogHandle { file: Some(file) })
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .context("failed to install tracing subscriber")?;
            Ok(LogHandle::default())
        }
    }
}
