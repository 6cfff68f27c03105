//! Event core.
//!
//! Consumes raw watcher notifications and synthetic events in order, hands
//! each candidate event to an event task for access checks and spawns one
//! action task per matching rule.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::actions::{ActionHandler, ActionOutcome};
use crate::clock::Clock;
use crate::collaborators::{AccessCheck, Collaborators};
use crate::config::{EngineConfig, Layout, WorkflowLogConfig};
use crate::dir_index::DirIndex;
use crate::event::{ChangeKind, FsEvent};
use crate::fs_watch::{EventSink, WatchMessage, WatchMode, WatchReceiver, WatchRegistry, WatchRequests, decompose};
use crate::hits::RuleHitRegistry;
use crate::miss_cache::MissCache;
use crate::paths::{PathMapper, display_path};
use crate::rules::{PatternMatch, Rule, RuleMap};
use crate::workflow_log::WorkflowLog;

/// State shared by the event core and every action task of one supervisor.
#[derive(Debug)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub layout: Arc<Layout>,
    pub paths: PathMapper,
    pub rules: Arc<RwLock<RuleMap>>,
    pub hits: RuleHitRegistry,
    pub collaborators: Collaborators,
    pub workflow_log: WorkflowLog,
    pub clock: Clock,
    pub cancel: CancellationToken,
    pub sink: EventSink,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        layout: Arc<Layout>,
        workflow_log: WorkflowLogConfig,
        rules: Arc<RwLock<RuleMap>>,
        collaborators: Collaborators,
        cancel: CancellationToken,
        sink: EventSink,
    ) -> Self {
        Self {
            paths: layout.path_mapper(),
            workflow_log: WorkflowLog::new(Arc::clone(&layout), workflow_log),
            hits: RuleHitRegistry::new(),
            clock: Clock::new(),
            config,
            layout,
            rules,
            collaborators,
            cancel,
            sink,
        }
    }
}

/// What the core did with one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// An identical event recently matched nothing.
    CachedMiss,
    /// No rule matched.
    Miss,
    /// This many action tasks were spawned.
    Scheduled(usize),
}

enum Admission {
    Decided(ProcessOutcome),
    /// An event task is checking access; its verdict carries this sequence.
    Checking(u64),
}

type Candidates = Vec<(String, Arc<Rule>)>;

/// Outcome of one event task: the candidates whose owner may act on the
/// tenant.
struct Verdict {
    seq: u64,
    event: FsEvent,
    matched: Candidates,
}

pub struct EventCore {
    ctx: Arc<EngineContext>,
    handler: ActionHandler,
    miss_cache: MissCache,
    dir_index: Arc<Mutex<DirIndex>>,
    data_watches: Option<(Arc<dyn WatchRegistry>, WatchRequests)>,
    pending: VecDeque<FsEvent>,
    checks: JoinSet<Verdict>,
    tasks: JoinSet<ActionOutcome>,
    permits: Arc<Semaphore>,
    seen_generation: u64,
    next_seq: u64,
}

impl fmt::Debug for EventCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCore")
            .field("miss_cache", &self.miss_cache.len())
            .field("checking", &self.checks.len())
            .field("running_tasks", &self.tasks.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl EventCore {
    pub fn new(ctx: Arc<EngineContext>, dir_index: Arc<Mutex<DirIndex>>) -> Self {
        let permits = Arc::new(Semaphore::new(ctx.config.max_concurrent_actions.max(1)));
        let seen_generation = ctx.rules.read().generation();
        Self {
            handler: ActionHandler::new(Arc::clone(&ctx)),
            miss_cache: MissCache::from_config(&ctx.config),
            ctx,
            dir_index,
            data_watches: None,
            pending: VecDeque::new(),
            checks: JoinSet::new(),
            tasks: JoinSet::new(),
            permits,
            seen_generation,
            next_seq: 0,
        }
    }

    /// Watches created directories in `registry` once it holds any watch.
    /// Must be called inside a tokio runtime.
    pub fn with_data_watches(mut self, registry: Arc<dyn WatchRegistry>) -> Self {
        let requests = WatchRequests::spawn(Arc::clone(&registry));
        self.data_watches = Some((registry, requests));
        self
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn miss_cache(&self) -> &MissCache {
        &self.miss_cache
    }

    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Main loop: admit raw and synthetic events, resolve event tasks into
    /// action tasks until cancelled, then drain running actions.
    pub async fn run(mut self, mut raw_rx: WatchReceiver, mut synthetic_rx: mpsc::UnboundedReceiver<FsEvent>) {
        let cancel = self.ctx.cancel.clone();
        info!(target: "rulewatch::events", "event core started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = raw_rx.recv() => match message {
                    Some(WatchMessage::Event(event)) => {
                        for fs_event in decompose(&event) {
                            self.admit_with_children(fs_event).await;
                        }
                    }
                    Some(WatchMessage::Error(message)) => {
                        warn!(target: "rulewatch::events", "watcher reported error: {message}");
                    }
                    None => {
                        warn!(target: "rulewatch::events", "watch channel closed");
                        break;
                    }
                },
                Some(event) = synthetic_rx.recv() => {
                    self.admit_with_children(event).await;
                }
                Some(joined) = self.checks.join_next(), if !self.checks.is_empty() => {
                    self.resolve(joined).await;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    log_joined(joined);
                }
            }
        }
        self.shutdown().await;
    }

    /// Process one event plus any child events its directory produced and
    /// wait until every resulting action task has been spawned.
    pub async fn process(&mut self, event: FsEvent) -> ProcessOutcome {
        let admission = self.admit_with_children(event).await;
        let mut outcome = match admission {
            Admission::Decided(outcome) => outcome,
            Admission::Checking(_) => ProcessOutcome::Miss,
        };
        while let Some(joined) = self.checks.join_next().await {
            if let Some((seq, resolved)) = self.resolve(joined).await
                && matches!(admission, Admission::Checking(first) if first == seq)
            {
                outcome = resolved;
            }
        }
        outcome
    }

    async fn admit_with_children(&mut self, event: FsEvent) -> Admission {
        let admission = self.admit(event).await;
        while let Some(next) = self.pending.pop_front() {
            self.admit(next).await;
        }
        admission
    }

    /// Ordered part of the pipeline. Everything up to the pattern filters
    /// runs here; access checks run in an event task.
    async fn admit(&mut self, mut event: FsEvent) -> Admission {
        let now = self.ctx.clock.now();
        event.observed_at = now;

        if !event.is_directory && event.path.is_symlink() && event.path.is_dir() {
            event.is_directory = true;
        }
        if !event.is_directory
            && event.kind == ChangeKind::Deleted
            && self.dir_index.lock().contains(&event.path)
        {
            event.is_directory = true;
        }
        if event.is_directory {
            self.track_directory(&event);
        }

        event.path = self.ctx.paths.mask_writable(&event.path);

        let generation = self.ctx.rules.read().generation();
        if generation != self.seen_generation {
            self.miss_cache.clear();
            self.seen_generation = generation;
        }
        if self.miss_cache.seen_miss(&event, now) {
            trace!(target: "rulewatch::events", path = %event.path.display(), change = %event.kind, "cached miss");
            return Admission::Decided(ProcessOutcome::CachedMiss);
        }

        let candidates = self.candidates(&event);
        if candidates.is_empty() {
            self.miss_cache.update(&event, false, now);
            return Admission::Decided(ProcessOutcome::Miss);
        }

        let Some(permit) = self.acquire_permit().await else {
            return Admission::Decided(ProcessOutcome::Scheduled(0));
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        let access = Arc::clone(&self.ctx.collaborators.access);
        self.checks.spawn(async move {
            let _permit = permit;
            let matched = filter_by_access(access.as_ref(), candidates).await;
            Verdict { seq, event, matched }
        });
        Admission::Checking(seq)
    }

    /// Record the verdict of an event task and spawn its action tasks.
    async fn resolve(&mut self, joined: Result<Verdict, JoinError>) -> Option<(u64, ProcessOutcome)> {
        let Verdict { seq, event, matched } = match joined {
            Ok(verdict) => verdict,
            Err(err) => {
                if !err.is_cancelled() {
                    warn!(target: "rulewatch::events", error = %err, "event task failed");
                }
                return None;
            }
        };

        let hit = !matched.is_empty();
        self.miss_cache.update(&event, hit, event.observed_at);
        if !hit {
            return Some((seq, ProcessOutcome::Miss));
        }

        let mut scheduled = 0;
        for (target, rule) in matched {
            debug!(
                target: "rulewatch::events",
                path = %event.path.display(),
                change = %event.kind,
                rule_id = %rule.rule_id,
                pattern = %target,
                "rule matched"
            );
            if !self.spawn_action(event.clone(), target, rule).await {
                break;
            }
            scheduled += 1;
        }
        Some((seq, ProcessOutcome::Scheduled(scheduled)))
    }

    fn track_directory(&mut self, event: &FsEvent) {
        match event.kind {
            ChangeKind::Created => {
                let children = self.dir_index.lock().refresh_on_create(&event.path);
                if let Some((registry, requests)) = &self.data_watches
                    && registry.watch_count() > 0
                    && !requests.request(event.path.clone(), WatchMode::Flat)
                {
                    warn!(target: "rulewatch::events", path = %event.path.display(), "watch placement stopped; created directory not watched");
                }
                if !children.is_empty() {
                    debug!(target: "rulewatch::events", path = %event.path.display(), children = children.len(), "synthesized events for directory contents");
                }
                self.pending.extend(children);
            }
            ChangeKind::Deleted => {
                let removed = self.dir_index.lock().remove_tree(&event.path);
                debug!(target: "rulewatch::events", path = %event.path.display(), removed, "dropped deleted directory from index");
            }
            ChangeKind::Modified => {}
        }
    }

    /// Rules whose pattern and cheap filters accept `event`, in map order.
    fn candidates(&self, event: &FsEvent) -> Vec<(String, Arc<Rule>)> {
        let path = display_path(&event.path);
        let map = self.ctx.rules.read();
        let mut candidates = Vec::new();
        for (target, entry) in map.iter() {
            let Some(matched) = entry.pattern.matches(&path) else {
                continue;
            };
            for rule in &entry.rules {
                if event.is_directory && !rule.match_dirs {
                    continue;
                }
                if !event.is_directory && !rule.match_files {
                    continue;
                }
                if matched == PatternMatch::RecursiveOnly && !rule.match_recursive {
                    continue;
                }
                if !rule.reacts_to(event.kind) {
                    continue;
                }
                candidates.push((target.to_string(), Arc::clone(rule)));
            }
        }
        candidates
    }

    /// Wait for a free task slot, retrying under load. `None` once cancelled.
    async fn acquire_permit(&mut self) -> Option<OwnedSemaphorePermit> {
        loop {
            match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => return Some(permit),
                Err(TryAcquireError::Closed) => return None,
                Err(TryAcquireError::NoPermits) => {
                    while let Some(joined) = self.tasks.try_join_next() {
                        log_joined(joined);
                    }
                    debug!(target: "rulewatch::events", running = self.tasks.len(), checking = self.checks.len(), "task slots exhausted; retrying");
                    tokio::select! {
                        _ = self.ctx.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(self.ctx.config.backpressure_retry()) => {}
                    }
                }
            }
        }
    }

    /// Spawn an action task, waiting for a free slot. Returns false when
    /// cancelled while waiting.
    async fn spawn_action(&mut self, event: FsEvent, target: String, rule: Arc<Rule>) -> bool {
        let Some(permit) = self.acquire_permit().await else {
            return false;
        };
        let handler = self.handler.clone();
        self.tasks.spawn(async move {
            let _permit = permit;
            handler.handle(event, target, rule).await
        });
        true
    }

    /// Wait for every running action task and return their outcomes.
    pub async fn settle_tasks(&mut self) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(target: "rulewatch::events", error = %err, "action task failed"),
            }
        }
        outcomes
    }

    /// Give running actions the configured grace period, then abort them.
    pub async fn shutdown(&mut self) {
        self.checks.abort_all();
        while self.checks.join_next().await.is_some() {}
        let grace = self.ctx.config.shutdown_grace();
        let running = self.tasks.len();
        if running > 0 {
            info!(target: "rulewatch::events", running, "waiting for running actions");
        }
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.tasks.join_next().await {
                log_joined(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(target: "rulewatch::events", remaining = self.tasks.len(), "aborting actions still running after grace period");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }
        info!(target: "rulewatch::events", "event core stopped");
    }
}

/// Candidates whose owner may act on the rule's tenant, in order. Each
/// owner and tenant pair is checked once.
async fn filter_by_access(access: &dyn AccessCheck, candidates: Candidates) -> Candidates {
    let mut allowed_pairs: HashMap<(String, String), bool> = HashMap::new();
    let mut matched = Vec::with_capacity(candidates.len());
    for (target, rule) in candidates {
        let key = (rule.owner.clone(), rule.tenant.clone());
        let allowed = match allowed_pairs.get(&key) {
            Some(allowed) => *allowed,
            None => {
                let allowed = access.has_access(&rule.owner, &rule.tenant).await;
                allowed_pairs.insert(key, allowed);
                allowed
            }
        };
        if allowed {
            matched.push((target, rule));
        } else {
            debug!(target: "rulewatch::events", tenant = %rule.tenant, owner = %rule.owner, rule_id = %rule.rule_id, "owner lacks access to tenant; skipping rule");
        }
    }
    matched
}

fn log_joined(joined: Result<ActionOutcome, JoinError>) {
    match joined {
        Ok(outcome) => trace!(target: "rulewatch::events", ?outcome, "action finished"),
        Err(err) if err.is_cancelled() => {}
        Err(err) => warn!(target: "rulewatch::events", error = %err, "action task failed"),
    }
}
