use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths::PathMapper;

/// Name of the pseudo tenant whose supervisor covers tenants without a
/// process of their own.
pub const ROOT_TENANT: &str = ".";

/// Default file name of the per-tenant rule file.
pub const DEFAULT_RULE_FILENAME: &str = "triggers";

/// Runtime knobs for the event engine.
///
/// All fields carry defaults so a configuration file only needs to name the
/// values it wants to change.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// How long an event fingerprint without matching rules stays cached.
    pub miss_cache_ttl_ms: u64,
    /// Size above which the miss cache sweeps expired entries.
    pub miss_cache_max_entries: usize,
    /// Slack used by the modify-noise filter when comparing mtimes.
    pub modify_slack_ms: u64,
    /// Upper bound of concurrently running action tasks.
    pub max_concurrent_actions: usize,
    /// Sleep between attempts to obtain an action slot under load.
    pub backpressure_retry_ms: u64,
    /// Base interval of the idle-tenant activation poll.
    pub activation_poll_ms: u64,
    /// Upper bound of the pid-derived jitter added to the activation poll.
    pub activation_jitter_ms: u64,
    /// Tick of the supervisor main loop.
    pub main_loop_tick_ms: u64,
    /// Queued watcher notifications above which a hub logs a backlog warning.
    pub watch_backlog_warning: usize,
    /// Grace period for in-flight work at shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            miss_cache_ttl_ms: 60_000,
            miss_cache_max_entries: 10_000,
            modify_slack_ms: 2_000,
            max_concurrent_actions: 64,
            backpressure_retry_ms: 100,
            activation_poll_ms: 30_000,
            activation_jitter_ms: 10_000,
            main_loop_tick_ms: 1_000,
            watch_backlog_warning: 4_096,
            shutdown_grace_ms: 30_000,
        }
    }
}

impl EngineConfig {
    pub fn miss_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.miss_cache_ttl_ms)
    }

    pub fn modify_slack(&self) -> Duration {
        Duration::from_millis(self.modify_slack_ms)
    }

    pub fn backpressure_retry(&self) -> Duration {
        Duration::from_millis(self.backpressure_retry_ms.max(1))
    }

    /// Poll interval for idle tenants, offset by a jitter derived from `seed`
    /// so sibling processes do not wake in lockstep.
    pub fn activation_interval(&self, seed: u64) -> Duration {
        let jitter = if self.activation_jitter_ms == 0 {
            0
        } else {
            seed % (self.activation_jitter_ms + 1)
        };
        Duration::from_millis(self.activation_poll_ms.max(1) + jitter)
    }

    pub fn main_loop_tick(&self) -> Duration {
        Duration::from_millis(self.main_loop_tick_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Rotation settings for the per-tenant workflow log.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkflowLogConfig {
    pub max_bytes: u64,
    pub backups: usize,
}

impl Default for WorkflowLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            backups: 1,
        }
    }
}

/// On-disk layout shared by every tenant.
///
/// Tenant metadata (rule files, caches, logs, pending jobs) lives under
/// `tenant_home/<tenant>`; tenant data lives under `files_home/<tenant>`.
/// Tenants may be nested, so a tenant name can contain `/`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub tenant_home: PathBuf,
    pub files_home: PathBuf,
    pub writable_home: Option<PathBuf>,
    pub rule_filename: String,
}

impl Layout {
    pub fn new(tenant_home: impl Into<PathBuf>, files_home: impl Into<PathBuf>) -> Self {
        Self {
            tenant_home: tenant_home.into(),
            files_home: files_home.into(),
            writable_home: None,
            rule_filename: DEFAULT_RULE_FILENAME.to_string(),
        }
    }

    pub fn with_writable_home(mut self, writable_home: impl Into<PathBuf>) -> Self {
        self.writable_home = Some(writable_home.into());
        self
    }

    pub fn with_rule_filename(mut self, rule_filename: impl Into<String>) -> Self {
        self.rule_filename = rule_filename.into();
        self
    }

    pub fn path_mapper(&self) -> PathMapper {
        PathMapper::new(self.files_home.clone(), self.writable_home.clone())
    }

    pub fn tenant_meta_dir(&self, tenant: &str) -> PathBuf {
        join_tenant(&self.tenant_home, tenant)
    }

    pub fn tenant_data_root(&self, tenant: &str) -> PathBuf {
        join_tenant(&self.files_home, tenant)
    }

    pub fn rule_file(&self, tenant: &str) -> PathBuf {
        self.tenant_meta_dir(tenant).join(&self.rule_filename)
    }

    pub fn dir_cache_file(&self, tenant: &str) -> PathBuf {
        self.tenant_meta_dir(tenant)
            .join(format!(".{}.dir_cache", self.rule_filename))
    }

    pub fn pending_jobs_dir(&self, tenant: &str) -> PathBuf {
        self.tenant_meta_dir(tenant)
            .join(format!(".{}.jobs", self.rule_filename))
            .join("pending_states")
    }

    pub fn workflow_log_file(&self, tenant: &str) -> PathBuf {
        self.tenant_meta_dir(tenant)
            .join(format!("{}.workflow.log", self.rule_filename))
    }

    pub fn is_rule_file(&self, path: &Path) -> bool {
        path.file_name()
            .is_some_and(|name| name == self.rule_filename.as_str())
    }

    /// Tenant owning the rule file at `path`, derived from its location
    /// below `tenant_home`.
    pub fn tenant_of_rule_file(&self, path: &Path) -> Option<String> {
        if !self.is_rule_file(path) {
            return None;
        }
        let parent = path.parent()?;
        self.tenant_of_meta_dir(parent)
    }

    /// Tenant name for a directory below `tenant_home`.
    pub fn tenant_of_meta_dir(&self, dir: &Path) -> Option<String> {
        let rel = dir.strip_prefix(&self.tenant_home).ok()?;
        tenant_name(rel)
    }
}

fn join_tenant(base: &Path, tenant: &str) -> PathBuf {
    if tenant == ROOT_TENANT || tenant.is_empty() {
        base.to_path_buf()
    } else {
        base.join(tenant)
    }
}

fn tenant_name(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Top-level component of a possibly nested tenant name.
pub fn top_level_tenant(tenant: &str) -> &str {
    tenant.split('/').next().unwrap_or(tenant)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new("/srv/meta", "/srv/files")
    }

    #[test]
    fn derives_tenant_from_rule_file_location() {
        let layout = layout();
        assert_eq!(
            layout.tenant_of_rule_file(Path::new("/srv/meta/alpha/triggers")),
            Some("alpha".to_string())
        );
        assert_eq!(
            layout.tenant_of_rule_file(Path::new("/srv/meta/alpha/sub/triggers")),
            Some("alpha/sub".to_string())
        );
        assert_eq!(layout.tenant_of_rule_file(Path::new("/srv/meta/triggers")), None);
        assert_eq!(
            layout.tenant_of_rule_file(Path::new("/srv/meta/alpha/other")),
            None
        );
    }

    #[test]
    fn metadata_files_live_under_tenant_home() {
        let layout = layout();
        assert_eq!(
            layout.dir_cache_file("alpha"),
            PathBuf::from("/srv/meta/alpha/.triggers.dir_cache")
        );
        assert_eq!(
            layout.pending_jobs_dir("alpha"),
            PathBuf::from("/srv/meta/alpha/.triggers.jobs/pending_states")
        );
        assert_eq!(
            layout.workflow_log_file("alpha/sub"),
            PathBuf::from("/srv/meta/alpha/sub/triggers.workflow.log")
        );
        assert_eq!(layout.tenant_data_root(ROOT_TENANT), PathBuf::from("/srv/files"));
    }

    #[test]
    fn activation_interval_stays_within_jitter_bound() {
        let config = EngineConfig {
            activation_poll_ms: 1_000,
            activation_jitter_ms: 500,
            ..EngineConfig::default()
        };
        for seed in [0_u64, 1, 499, 500, 501, 12_345] {
            let interval = config.activation_interval(seed);
            assert!(interval >= Duration::from_millis(1_000));
            assert!(interval <= Duration::from_millis(1_500));
        }
    }
}
