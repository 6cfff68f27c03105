//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rulewatch_core::collaborators::{
    AccessCheck, Collaborators, CommandOutput, CommandRunner, JobSubmitter, ParamRange,
    PatternLookup, SubmitReceipt, WorkflowPattern,
};
use rulewatch_core::config::{EngineConfig, Layout, WorkflowLogConfig};
use rulewatch_core::dir_index::DirIndex;
use rulewatch_core::engine::{EngineContext, EventCore};
use rulewatch_core::error::{EngineError, Result};
use rulewatch_core::event::{ChangeKind, FsEvent};
use rulewatch_core::fs_watch::EventSink;
use rulewatch_core::rules::{RuleMap, RuleStore};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct Submission {
    pub contents: String,
    pub owner: String,
    pub tenant: String,
    pub at: Instant,
}

#[derive(Default)]
pub struct RecordingSubmitter {
    pub submissions: Mutex<Vec<Submission>>,
}

#[async_trait]
impl JobSubmitter for RecordingSubmitter {
    async fn submit(&self, job_file: &Path, owner: &str, tenant: &str) -> Result<SubmitReceipt> {
        let contents =
            fs::read_to_string(job_file).map_err(|err| EngineError::io(job_file, err))?;
        let mut submissions = self.submissions.lock();
        submissions.push(Submission {
            contents,
            owner: owner.to_string(),
            tenant: tenant.to_string(),
            at: Instant::now(),
        });
        Ok(SubmitReceipt {
            job_id: format!("job-{}", submissions.len()),
            message: "queued".into(),
        })
    }
}

impl RecordingSubmitter {
    pub fn count(&self) -> usize {
        self.submissions.lock().len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandCall {
    pub command: String,
    pub args: Vec<String>,
    pub owner: String,
    pub tenant: String,
}

#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<CommandCall>>,
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str, args: &[String], owner: &str, tenant: &str) -> Result<CommandOutput> {
        self.calls.lock().push(CommandCall {
            command: command.to_string(),
            args: args.to_vec(),
            owner: owner.to_string(),
            tenant: tenant.to_string(),
        });
        Ok(CommandOutput::default())
    }
}

impl RecordingRunner {
    pub fn calls(&self) -> Vec<CommandCall> {
        self.calls.lock().clone()
    }
}

/// Grants access to everyone except the listed owners.
#[derive(Default)]
pub struct DenyList {
    pub denied: Vec<String>,
}

#[async_trait]
impl AccessCheck for DenyList {
    async fn has_access(&self, owner: &str, _tenant: &str) -> bool {
        !self.denied.iter().any(|denied| denied == owner)
    }
}

#[derive(Default)]
pub struct FixedPatterns {
    pub patterns: HashMap<String, WorkflowPattern>,
}

#[async_trait]
impl PatternLookup for FixedPatterns {
    async fn get_pattern(&self, pattern_id: &str) -> Result<Option<WorkflowPattern>> {
        Ok(self.patterns.get(pattern_id).cloned())
    }
}

pub fn sweep_pattern(id: &str, over: &[(&str, f64, f64, f64)]) -> WorkflowPattern {
    WorkflowPattern {
        persistence_id: id.to_string(),
        name: id.to_string(),
        trigger_recipes: Value::Null,
        parameterize_over: over
            .iter()
            .map(|(name, start, stop, step)| {
                (
                    name.to_string(),
                    ParamRange {
                        start: *start,
                        stop: *stop,
                        step: *step,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>(),
    }
}

/// A temporary tenant tree plus recording collaborators.
pub struct Fixture {
    pub tmp: TempDir,
    pub layout: Arc<Layout>,
    pub submitter: Arc<RecordingSubmitter>,
    pub runner: Arc<RecordingRunner>,
    pub access: Arc<DenyList>,
    pub patterns: Arc<FixedPatterns>,
    pub rules: Arc<RwLock<RuleMap>>,
    pub cancel: CancellationToken,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_patterns(FixedPatterns::default(), DenyList::default())
    }

    pub fn with_patterns(patterns: FixedPatterns, access: DenyList) -> Self {
        let tmp = tempfile::tempdir().expect("temp dir");
        let layout = Layout::new(tmp.path().join("meta"), tmp.path().join("files"));
        Self::build(tmp, layout, patterns, access)
    }

    /// A fixture whose data tree is also reachable through a writable
    /// overlay rooted at `<tmp>/writable`.
    pub fn with_writable_overlay() -> Self {
        let tmp = tempfile::tempdir().expect("temp dir");
        let layout = Layout::new(tmp.path().join("meta"), tmp.path().join("files"))
            .with_writable_home(tmp.path().join("writable"));
        Self::build(tmp, layout, FixedPatterns::default(), DenyList::default())
    }

    fn build(tmp: TempDir, layout: Layout, patterns: FixedPatterns, access: DenyList) -> Self {
        let layout = Arc::new(layout);
        fs::create_dir_all(&layout.tenant_home).expect("tenant home");
        fs::create_dir_all(&layout.files_home).expect("files home");
        Self {
            tmp,
            layout,
            submitter: Arc::new(RecordingSubmitter::default()),
            runner: Arc::new(RecordingRunner::default()),
            access: Arc::new(access),
            patterns: Arc::new(patterns),
            rules: Arc::new(RwLock::new(RuleMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            submitter: self.submitter.clone(),
            commands: self.runner.clone(),
            access: self.access.clone(),
            patterns: self.patterns.clone(),
        }
    }

    pub fn store(&self) -> RuleStore {
        RuleStore::new(Arc::clone(&self.layout), Arc::clone(&self.rules))
    }

    pub fn data_path(&self, tenant: &str, rel: &str) -> PathBuf {
        self.layout.tenant_data_root(tenant).join(rel)
    }

    /// Create a file (and its parents) at `rel` inside the writable overlay.
    pub fn touch_writable(&self, tenant: &str, rel: &str) -> PathBuf {
        let root = self.tmp.path().join("writable");
        let path = root.join(tenant).join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("overlay dir");
        fs::write(&path, b"data").expect("overlay file");
        path
    }

    /// Create a file (and its parents) below the tenant's data root.
    pub fn touch(&self, tenant: &str, rel: &str) -> PathBuf {
        let path = self.data_path(tenant, rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("data dir");
        fs::write(&path, b"data").expect("data file");
        path
    }

    /// Write `rules` as the tenant's rule file and load it.
    pub fn install_rules(&self, tenant: &str, rules: Vec<Value>) {
        let path = self.write_rule_file(tenant, rules);
        self.store()
            .apply_rule_file_event(&path, ChangeKind::Modified)
            .expect("rule file applies");
    }

    pub fn write_rule_file(&self, tenant: &str, rules: Vec<Value>) -> PathBuf {
        let path = self.layout.rule_file(tenant);
        fs::create_dir_all(path.parent().expect("parent")).expect("meta dir");
        fs::write(&path, serde_json::to_vec(&Value::Array(rules)).expect("json"))
            .expect("rule file");
        path
    }

    pub fn core(&self, config: EngineConfig) -> (EventCore, mpsc::UnboundedReceiver<FsEvent>) {
        let (sink, synthetic_rx) = EventSink::channel();
        let ctx = Arc::new(EngineContext::new(
            config,
            Arc::clone(&self.layout),
            WorkflowLogConfig::default(),
            Arc::clone(&self.rules),
            self.collaborators(),
            self.cancel.clone(),
            sink,
        ));
        let index = Arc::new(Mutex::new(DirIndex::ephemeral(self.layout.files_home.clone())));
        (EventCore::new(ctx, index), synthetic_rx)
    }

    pub fn workflow_log(&self, tenant: &str) -> String {
        fs::read_to_string(self.layout.workflow_log_file(tenant)).unwrap_or_default()
    }
}

pub fn rule(id: &str, path: &str, changes: &[&str], action: &str, arguments: &[&str]) -> Value {
    json!({
        "rule_id": id,
        "run_as": "alice",
        "path": path,
        "changes": changes,
        "action": action,
        "arguments": arguments,
    })
}

pub fn created(path: PathBuf) -> FsEvent {
    FsEvent::new(path, ChangeKind::Created, false)
}
