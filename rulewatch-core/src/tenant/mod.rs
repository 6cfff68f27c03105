//! Tenant supervisor.
//!
//! One supervisor runs per tenant process. It owns the rule watcher, the
//! directory index and the event core of its tenant, stays idle until a rule
//! targets the tenant and only then installs data watches.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::collaborators::Collaborators;
use crate::config::{EngineConfig, Layout, ROOT_TENANT, WorkflowLogConfig, top_level_tenant};
use crate::dir_index::DirIndex;
use crate::engine::{EngineContext, EventCore};
use crate::error::{EngineError, Result};
use crate::event::{ChangeKind, FsEvent};
use crate::fs_watch::{
    EventSink, WatchHub, WatchMessage, WatchMode, WatchReceiver, WatchRegistry, decompose, install_watches,
};
use crate::rules::{RuleMap, RuleStore};

/// Which tenants a supervisor is responsible for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantScope {
    /// A tenant and every tenant nested below it.
    Concrete(String),
    /// Every top-level tenant except those with a process of their own.
    Root { excluded: BTreeSet<String> },
}

impl TenantScope {
    /// Root scope excluding every tenant present under `tenant_home` now.
    pub fn root_excluding_existing(layout: &Layout) -> io::Result<Self> {
        Ok(TenantScope::Root {
            excluded: discover_tenants(layout)?.into_iter().collect(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            TenantScope::Concrete(tenant) => tenant,
            TenantScope::Root { .. } => ROOT_TENANT,
        }
    }

    pub fn covers(&self, tenant: &str) -> bool {
        match self {
            TenantScope::Concrete(own) => {
                tenant == own
                    || tenant
                        .strip_prefix(own.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            TenantScope::Root { excluded } => {
                tenant != ROOT_TENANT && !excluded.contains(top_level_tenant(tenant))
            }
        }
    }
}

impl fmt::Display for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Top-level tenants currently present under `tenant_home`, sorted.
pub fn discover_tenants(layout: &Layout) -> io::Result<Vec<String>> {
    let mut tenants = Vec::new();
    for entry in fs::read_dir(&layout.tenant_home)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            tenants.push(name);
        }
    }
    tenants.sort();
    Ok(tenants)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorPhase {
    Loading,
    /// Rules loaded, no rule targets the tenant yet.
    Idle,
    Active,
    Stopped,
}

pub struct TenantSupervisor {
    scope: TenantScope,
    layout: Arc<Layout>,
    config: EngineConfig,
    workflow_log: WorkflowLogConfig,
    collaborators: Collaborators,
    cancel: CancellationToken,
    phase: watch::Sender<SupervisorPhase>,
}

impl fmt::Debug for TenantSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantSupervisor")
            .field("scope", &self.scope)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl TenantSupervisor {
    pub fn new(
        scope: TenantScope,
        layout: Arc<Layout>,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Self {
        let (phase, _) = watch::channel(SupervisorPhase::Loading);
        Self {
            scope,
            layout,
            config: EngineConfig::default(),
            workflow_log: WorkflowLogConfig::default(),
            collaborators,
            cancel,
            phase,
        }
    }

    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_workflow_log(mut self, config: WorkflowLogConfig) -> Self {
        self.workflow_log = config;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorPhase> {
        self.phase.subscribe()
    }

    /// Run until cancelled. Fails only on startup errors: a watcher that
    /// cannot be created or a directory index that cannot be loaded.
    pub async fn run(self) -> Result<()> {
        let tenant = self.scope.name().to_string();
        info!(target: "rulewatch::supervisor", tenant = %tenant, "starting tenant supervisor");

        let rule_map = Arc::new(RwLock::new(RuleMap::new()));
        let store = Arc::new(RuleStore::new(Arc::clone(&self.layout), Arc::clone(&rule_map)));
        let backlog_warning = self.config.watch_backlog_warning;

        let (rule_hub, rule_rx) = WatchHub::spawn("rules", backlog_warning)?;
        let rule_watcher = RuleWatcher {
            scope: self.scope.clone(),
            layout: Arc::clone(&self.layout),
            store: Arc::clone(&store),
            hub: Arc::clone(&rule_hub),
        };
        let rule_watcher = tokio::task::spawn_blocking(move || {
            rule_watcher.watch_and_load()?;
            Ok::<_, EngineError>(rule_watcher)
        })
        .await
        .map_err(|err| EngineError::Internal(format!("rule loading task failed: {err}")))??;

        let dir_index = match &self.scope {
            TenantScope::Concrete(name) => {
                let cache_file = self.layout.dir_cache_file(name);
                let data_root = self.layout.tenant_data_root(name);
                tokio::task::spawn_blocking(move || DirIndex::load(cache_file, data_root))
                    .await
                    .map_err(|err| EngineError::Internal(format!("directory index task failed: {err}")))??
            }
            TenantScope::Root { .. } => DirIndex::ephemeral(self.layout.files_home.clone()),
        };
        let dir_index = Arc::new(Mutex::new(dir_index));

        let (data_hub, data_rx) = WatchHub::spawn("data", backlog_warning)?;
        let (sink, synthetic_rx) = EventSink::channel();
        let ctx = Arc::new(EngineContext::new(
            self.config.clone(),
            Arc::clone(&self.layout),
            self.workflow_log,
            Arc::clone(&rule_map),
            self.collaborators.clone(),
            self.cancel.clone(),
            sink,
        ));
        let core = EventCore::new(ctx, Arc::clone(&dir_index))
            .with_data_watches(Arc::clone(&data_hub) as Arc<dyn WatchRegistry>);
        let core_task = tokio::spawn(core.run(data_rx, synthetic_rx));
        let rule_task = tokio::spawn(rule_watcher.run(rule_rx, self.cancel.clone()));

        self.phase.send_replace(SupervisorPhase::Idle);
        let mut synced = BTreeSet::new();
        let mut watches_installed = 0;
        if self.wait_for_rules(&rule_map).await {
            watches_installed += self
                .sync_data_watches(&data_hub, &dir_index, &rule_map, &mut synced)
                .await;
            info!(
                target: "rulewatch::supervisor",
                tenant = %tenant,
                watches = data_hub.watch_count(),
                "tenant active"
            );
            self.phase.send_replace(SupervisorPhase::Active);

            let tick = self.config.main_loop_tick();
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(tick) => {
                        if matches!(self.scope, TenantScope::Root { .. }) {
                            watches_installed += self
                                .sync_data_watches(&data_hub, &dir_index, &rule_map, &mut synced)
                                .await;
                        }
                    }
                }
            }
        }

        info!(target: "rulewatch::supervisor", tenant = %tenant, "stopping tenant supervisor");
        let grace = self.config.shutdown_grace();
        join_with_grace("event core", core_task, grace).await;
        join_with_grace("rule watcher", rule_task, grace).await;

        if watches_installed > 0 || data_hub.watch_count() > 0 {
            let index = Arc::clone(&dir_index);
            match tokio::task::spawn_blocking(move || index.lock().save()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(target: "rulewatch::supervisor", tenant = %tenant, error = %err, "failed to save directory index");
                }
                Err(err) => {
                    error!(target: "rulewatch::supervisor", tenant = %tenant, error = %err, "directory index save task failed");
                }
            }
        }
        self.phase.send_replace(SupervisorPhase::Stopped);
        info!(target: "rulewatch::supervisor", tenant = %tenant, "tenant supervisor stopped");
        Ok(())
    }

    fn has_active_rules(&self, rules: &RwLock<RuleMap>) -> bool {
        let map = rules.read();
        match &self.scope {
            TenantScope::Concrete(name) => map.has_rules_under(name),
            TenantScope::Root { .. } => map.tenants().iter().any(|tenant| self.scope.covers(tenant)),
        }
    }

    /// Poll until a rule targets this scope. Returns false when cancelled
    /// first.
    async fn wait_for_rules(&self, rules: &RwLock<RuleMap>) -> bool {
        let interval = self.config.activation_interval(u64::from(std::process::id()));
        loop {
            if self.has_active_rules(rules) {
                return true;
            }
            debug!(target: "rulewatch::supervisor", tenant = %self.scope, ?interval, "no active rules; idling");
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Install data watches for tenants that gained rules since the last
    /// call. Returns the number of new watches.
    async fn sync_data_watches(
        &self,
        hub: &Arc<WatchHub>,
        dir_index: &Arc<Mutex<DirIndex>>,
        rules: &RwLock<RuleMap>,
        synced: &mut BTreeSet<String>,
    ) -> usize {
        let fresh: Vec<String> = match &self.scope {
            TenantScope::Concrete(name) => {
                if !synced.insert(name.clone()) {
                    return 0;
                }
                Vec::new()
            }
            TenantScope::Root { .. } => {
                let fresh: BTreeSet<String> = rules
                    .read()
                    .tenants()
                    .iter()
                    .filter(|tenant| self.scope.covers(tenant))
                    .map(|tenant| top_level_tenant(tenant).to_string())
                    .filter(|top| !synced.contains(top))
                    .collect();
                if fresh.is_empty() {
                    return 0;
                }
                fresh.into_iter().collect()
            }
        };

        let layout = Arc::clone(&self.layout);
        let index = Arc::clone(dir_index);
        let registry = Arc::clone(hub);
        let installed = tokio::task::spawn_blocking(move || {
            let mut adopted = Vec::new();
            let dirs = if fresh.is_empty() {
                index.lock().directories()
            } else {
                let mut dirs = Vec::new();
                for top in fresh {
                    let data_root = layout.tenant_data_root(&top);
                    if !data_root.is_dir() {
                        continue;
                    }
                    let mut index = index.lock();
                    index.scan(&data_root);
                    dirs.extend(index.directories_under(&data_root));
                    adopted.push(top);
                }
                dirs
            };
            (install_watches(registry.as_ref(), &dirs), adopted)
        })
        .await;

        match installed {
            Ok((added, adopted)) => {
                synced.extend(adopted);
                if added > 0 {
                    info!(target: "rulewatch::supervisor", tenant = %self.scope, added, "installed data watches");
                }
                added
            }
            Err(err) => {
                error!(target: "rulewatch::supervisor", tenant = %self.scope, error = %err, "data watch installation failed");
                0
            }
        }
    }
}

async fn join_with_grace(label: &str, task: JoinHandle<()>, grace: std::time::Duration) {
    let abort = task.abort_handle();
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) if err.is_cancelled() => {}
        Ok(Err(err)) => warn!(target: "rulewatch::supervisor", task = label, error = %err, "task failed"),
        Err(_) => {
            warn!(target: "rulewatch::supervisor", task = label, "task did not stop in time; aborting");
            abort.abort();
        }
    }
}

/// Follows rule files below the scope's metadata tree.
#[derive(Clone)]
struct RuleWatcher {
    scope: TenantScope,
    layout: Arc<Layout>,
    store: Arc<RuleStore>,
    hub: Arc<WatchHub>,
}

impl RuleWatcher {
    /// Place the rule watches and load every rule file already on disk.
    fn watch_and_load(&self) -> Result<()> {
        match &self.scope {
            TenantScope::Concrete(name) => {
                let meta_dir = self.layout.tenant_meta_dir(name);
                fs::create_dir_all(&meta_dir)?;
                self.hub.add_watch(&meta_dir, WatchMode::Recursive)?;
                self.load_tree(&meta_dir);
            }
            TenantScope::Root { .. } => {
                let home = self.layout.tenant_home.clone();
                self.hub.add_watch(&home, WatchMode::Flat)?;
                for tenant in discover_tenants(&self.layout)? {
                    if self.scope.covers(&tenant) {
                        self.adopt_tenant_dir(&self.layout.tenant_meta_dir(&tenant));
                    }
                }
            }
        }
        Ok(())
    }

    async fn run(self, mut rx: WatchReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(WatchMessage::Event(event)) => {
                        for fs_event in decompose(&event) {
                            self.handle(&fs_event);
                        }
                    }
                    Some(WatchMessage::Error(message)) => {
                        warn!(target: "rulewatch::rules", "rule watcher reported error: {message}");
                    }
                    None => break,
                },
            }
        }
        debug!(target: "rulewatch::rules", tenant = %self.scope, "rule watcher stopped");
    }

    fn handle(&self, event: &FsEvent) {
        if self.layout.is_rule_file(&event.path) {
            let Some(tenant) = self.layout.tenant_of_rule_file(&event.path) else {
                return;
            };
            if self.scope.covers(&tenant) {
                self.apply(&event.path, event.kind);
            }
            return;
        }
        if !event.is_directory || is_hidden(&event.path) {
            return;
        }
        let Some(tenant) = self.layout.tenant_of_meta_dir(&event.path) else {
            return;
        };
        if !self.scope.covers(&tenant) {
            return;
        }
        match event.kind {
            ChangeKind::Created => {
                info!(target: "rulewatch::rules", tenant = %tenant, "rule directory appeared");
                let watcher = self.clone();
                let dir = event.path.clone();
                tokio::task::spawn_blocking(move || watcher.adopt_tenant_dir(&dir));
            }
            ChangeKind::Deleted => {
                self.store.remove_tenant_tree(&tenant);
            }
            ChangeKind::Modified => {}
        }
    }

    fn adopt_tenant_dir(&self, dir: &Path) {
        if matches!(self.scope, TenantScope::Root { .. })
            && let Err(err) = self.hub.add_watch(dir, WatchMode::Recursive)
        {
            warn!(target: "rulewatch::rules", path = %dir.display(), error = %err, "failed to watch rule directory");
        }
        self.load_tree(dir);
    }

    /// Load every covered rule file below `dir`. Returns how many were read.
    fn load_tree(&self, dir: &Path) -> usize {
        let mut loaded = 0;
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));
        for entry in walker.flatten() {
            if !entry.file_type().is_file() || !self.layout.is_rule_file(entry.path()) {
                continue;
            }
            let covered = self
                .layout
                .tenant_of_rule_file(entry.path())
                .is_some_and(|tenant| self.scope.covers(&tenant));
            if covered {
                self.apply(entry.path(), ChangeKind::Created);
                loaded += 1;
            }
        }
        loaded
    }

    fn apply(&self, path: &Path, kind: ChangeKind) {
        if let Err(err) = self.store.apply_rule_file_event(path, kind) {
            warn!(target: "rulewatch::rules", path = %path.display(), error = %err, "failed to apply rule file change");
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn concrete_scope_covers_nested_tenants_only() {
        let scope = TenantScope::Concrete("alpha".into());
        assert!(scope.covers("alpha"));
        assert!(scope.covers("alpha/sub"));
        assert!(!scope.covers("alphabet"));
        assert!(!scope.covers("beta"));
    }

    #[test]
    fn root_scope_skips_tenants_with_own_process() {
        let scope = TenantScope::Root {
            excluded: BTreeSet::from(["alpha".to_string()]),
        };
        assert_eq!(scope.name(), ROOT_TENANT);
        assert!(!scope.covers("alpha"));
        assert!(!scope.covers("alpha/sub"));
        assert!(scope.covers("gamma"));
        assert!(scope.covers("gamma/sub"));
    }

    #[test]
    fn discovers_visible_tenant_directories() {
        let tmp = tempdir().unwrap();
        let home = tmp.path().join("meta");
        fs::create_dir_all(home.join("beta")).unwrap();
        fs::create_dir_all(home.join("alpha")).unwrap();
        fs::create_dir_all(home.join(".cache")).unwrap();
        fs::write(home.join("notes"), b"").unwrap();
        let layout = Layout::new(&home, tmp.path().join("files"));

        assert_eq!(discover_tenants(&layout).unwrap(), vec!["alpha", "beta"]);
        let TenantScope::Root { excluded } = TenantScope::root_excluding_existing(&layout).unwrap() else {
            panic!("expected root scope");
        };
        assert_eq!(excluded.len(), 2);
    }
}
