//! Parent and tenant process lifecycles.
//!
//! The parent enumerates tenants, spawns one `rulewatchd tenant <name>`
//! process per top-level tenant plus one for the root pseudo tenant and
//! waits. On shutdown it forwards SIGINT to every child and kills the ones
//! that outlive the grace period. Children are never restarted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use parking_lot::Mutex;
use rulewatch_config::Config;
use rulewatch_core::config::{Layout, ROOT_TENANT};
use rulewatch_core::tenant::{TenantScope, TenantSupervisor, discover_tenants};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backends;

/// Environment variable carrying the parent's tenant roster to the root
/// tenant process, as a JSON list.
pub const ROOT_EXCLUDE_ENV: &str = "RULEWATCH_ROOT_EXCLUDE";

/// How a tenant process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signalled(i32),
    /// Outlived the shutdown grace period and was killed.
    Killed,
    WaitFailed(String),
}

impl ChildExit {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ChildExit::Exited(code),
            (None, Some(signal)) => ChildExit::Signalled(signal),
            (None, None) => ChildExit::WaitFailed("unknown exit status".into()),
        }
    }
}

/// Command line used to start tenant processes.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    pub program: PathBuf,
    pub base_args: Vec<String>,
}

impl ChildCommand {
    /// Re-invoke the running binary with the same configuration and level.
    pub fn current_exe(config_path: Option<&Path>, log_level: Option<&str>) -> std::io::Result<Self> {
        let mut base_args = Vec::new();
        if let Some(path) = config_path {
            base_args.push("--config".to_string());
            base_args.push(path.display().to_string());
        }
        if let Some(level) = log_level {
            base_args.push(level.to_string());
        }
        Ok(Self {
            program: std::env::current_exe()?,
            base_args,
        })
    }

    pub fn for_tenant(&self, tenant: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("tenant")
            .arg(tenant)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

/// Pids of the running tenant processes, keyed by tenant.
#[derive(Debug, Clone, Default)]
pub struct ChildPids {
    inner: Arc<Mutex<BTreeMap<String, i32>>>,
}

impl ChildPids {
    fn insert(&self, tenant: &str, pid: i32) {
        self.inner.lock().insert(tenant.to_string(), pid);
    }

    fn remove(&self, tenant: &str) {
        self.inner.lock().remove(tenant);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Send `signal` to every running tenant process.
    pub fn signal_all(&self, signal: Signal) {
        for (tenant, pid) in self.inner.lock().iter() {
            if let Err(err) = kill(Pid::from_raw(*pid), signal) {
                warn!(target: "rulewatch::supervisor", tenant = %tenant, pid, error = %err, ?signal, "failed to signal tenant process");
            }
        }
    }
}

#[derive(Debug)]
pub struct TenantProcess {
    pub tenant: String,
    child: Child,
}

impl TenantProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Start one process per tenant. The root tenant process is told which
/// tenants have a process of their own. Tenants whose process cannot be
/// started are logged and skipped.
pub fn spawn_tenants(command: &ChildCommand, tenants: &[String], pids: &ChildPids) -> Vec<TenantProcess> {
    let roster: Vec<&str> = tenants
        .iter()
        .map(String::as_str)
        .filter(|tenant| *tenant != ROOT_TENANT)
        .collect();
    let roster = serde_json::to_string(&roster).unwrap_or_else(|_| "[]".to_string());

    let mut processes = Vec::with_capacity(tenants.len());
    for tenant in tenants {
        let mut cmd = command.for_tenant(tenant);
        if tenant == ROOT_TENANT {
            cmd.env(ROOT_EXCLUDE_ENV, &roster);
        }
        match cmd.spawn() {
            Ok(child) => {
                if let Some(pid) = child.id() {
                    pids.insert(tenant, pid as i32);
                }
                info!(target: "rulewatch::supervisor", tenant = %tenant, pid = ?child.id(), "started tenant process");
                processes.push(TenantProcess {
                    tenant: tenant.clone(),
                    child,
                });
            }
            Err(err) => {
                error!(target: "rulewatch::supervisor", tenant = %tenant, error = %err, "failed to start tenant process");
            }
        }
    }
    processes
}

/// Wait for every tenant process. Once `cancel` fires each remaining child
/// gets SIGINT and `grace` to exit before it is killed.
pub async fn supervise(
    processes: Vec<TenantProcess>,
    cancel: CancellationToken,
    grace: Duration,
    pids: ChildPids,
) -> Vec<(String, ChildExit)> {
    let watchers = processes
        .into_iter()
        .map(|process| watch_child(process, cancel.clone(), grace, pids.clone()));
    join_all(watchers).await
}

async fn watch_child(
    mut process: TenantProcess,
    cancel: CancellationToken,
    grace: Duration,
    pids: ChildPids,
) -> (String, ChildExit) {
    let tenant = process.tenant.clone();
    let early = tokio::select! {
        status = process.child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let exit = match early {
        Some(Ok(status)) => {
            let exit = ChildExit::from_status(status);
            // Restarting is left to the operator.
            error!(target: "rulewatch::supervisor", tenant = %tenant, ?exit, "tenant process exited before shutdown");
            exit
        }
        Some(Err(err)) => ChildExit::WaitFailed(err.to_string()),
        None => stop_child(&mut process, grace).await,
    };

    pids.remove(&tenant);
    info!(target: "rulewatch::supervisor", tenant = %tenant, ?exit, "tenant process finished");
    (tenant, exit)
}

async fn stop_child(process: &mut TenantProcess, grace: Duration) -> ChildExit {
    if let Some(pid) = process.child.id()
        && let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT)
    {
        warn!(target: "rulewatch::supervisor", tenant = %process.tenant, pid, error = %err, "failed to forward SIGINT");
    }

    match tokio::time::timeout(grace, process.child.wait()).await {
        Ok(Ok(status)) => ChildExit::from_status(status),
        Ok(Err(err)) => ChildExit::WaitFailed(err.to_string()),
        Err(_) => {
            warn!(target: "rulewatch::supervisor", tenant = %process.tenant, grace = ?grace, "tenant process ignored SIGINT, killing");
            if let Err(err) = process.child.kill().await {
                warn!(target: "rulewatch::supervisor", tenant = %process.tenant, error = %err, "failed to kill tenant process");
            }
            ChildExit::Killed
        }
    }
}

/// Tenants that get a process of their own, root pseudo tenant last.
pub fn tenant_roster(config: &Config) -> anyhow::Result<Vec<String>> {
    let layout = config.layout();
    fs::create_dir_all(&layout.tenant_home)
        .with_context(|| format!("failed to create {}", layout.tenant_home.display()))?;
    let mut tenants = discover_tenants(&layout)
        .with_context(|| format!("failed to list tenants in {}", layout.tenant_home.display()))?;
    tenants.push(ROOT_TENANT.to_string());
    Ok(tenants)
}

pub async fn run_parent(
    config: &Config,
    command: ChildCommand,
    cancel: CancellationToken,
    pids: ChildPids,
) -> anyhow::Result<Vec<(String, ChildExit)>> {
    let tenants = tenant_roster(config)?;
    info!(target: "rulewatch::supervisor", tenants = tenants.len(), "starting tenant processes");

    let processes = spawn_tenants(&command, &tenants, &pids);
    let exits = supervise(processes, cancel, config.supervisor.child_shutdown_grace, pids).await;

    let failed = exits
        .iter()
        .filter(|(_, exit)| !matches!(exit, ChildExit::Exited(0)))
        .count();
    info!(target: "rulewatch::supervisor", total = exits.len(), failed, "all tenant processes finished");
    Ok(exits)
}

/// Scope of a tenant process. The root tenant excludes the parent's roster
/// when one was handed down and every tenant present now otherwise.
pub fn tenant_scope(layout: &Layout, tenant: &str, roster: Option<&str>) -> anyhow::Result<TenantScope> {
    if tenant != ROOT_TENANT {
        return Ok(TenantScope::Concrete(tenant.to_string()));
    }
    match roster {
        Some(raw) => {
            let excluded: BTreeSet<String> =
                serde_json::from_str(raw).with_context(|| format!("malformed {ROOT_EXCLUDE_ENV}: {raw}"))?;
            Ok(TenantScope::Root { excluded })
        }
        None => TenantScope::root_excluding_existing(layout)
            .with_context(|| format!("failed to list tenants in {}", layout.tenant_home.display())),
    }
}

/// Body of a `rulewatchd tenant <name>` process.
pub async fn run_tenant(
    config: &Config,
    tenant: &str,
    roster: Option<&str>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let layout = Arc::new(config.layout());
    let scope = tenant_scope(&layout, tenant, roster)?;
    let collaborators = backends::collaborators(config, Arc::clone(&layout));

    TenantSupervisor::new(scope, layout, collaborators, cancel)
        .with_engine_config(config.engine.clone())
        .with_workflow_log(config.workflow_log)
        .run()
        .await
        .with_context(|| format!("tenant supervisor for {tenant} failed"))
}
