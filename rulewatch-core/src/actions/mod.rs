//! Action handlers.
//!
//! One handler task runs per matched `(event, target, rule)`. It applies the
//! rule's settle and rate limits, filters access-time-only modifications,
//! waits for the path to settle and finally dispatches the rule's action.
//! Failures become [`ActionOutcome`] values and workflow log lines; nothing
//! here is fatal to the supervisor.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::clock::advance;
use crate::engine::EngineContext;
use crate::event::{ChangeKind, FsEvent};
use crate::hits::LimitKind;
use crate::paths::display_path;
use crate::rules::{Rule, RuleAction};

pub mod expand;
pub mod submit;
pub mod trigger;

pub use expand::ExpansionMap;
pub use submit::{PendingEvent, PendingJob, fill_template, parameter_tuples, parameter_values};
pub use trigger::{ChainStep, extend_chain};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    SettleTime,
    RateLimit,
    AccessTimeOnly,
}

impl From<LimitKind> for SkipReason {
    fn from(kind: LimitKind) -> Self {
        match kind {
            LimitKind::SettleTime => SkipReason::SettleTime,
            LimitKind::RateLimit => SkipReason::RateLimit,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::SettleTime => "settle time",
            SkipReason::RateLimit => "rate limit",
            SkipReason::AccessTimeOnly => "access time only",
        })
    }
}

/// How one handler task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Skipped(SkipReason),
    Dispatched,
    Failed(String),
    Cancelled,
}

impl ActionOutcome {
    pub fn is_dispatched(&self) -> bool {
        matches!(self, ActionOutcome::Dispatched)
    }
}

#[derive(Clone, Debug)]
pub struct ActionHandler {
    ctx: Arc<EngineContext>,
}

impl ActionHandler {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, event: FsEvent, target: String, rule: Arc<Rule>) -> ActionOutcome {
        let ctx = &self.ctx;
        let tenant = rule.tenant.as_str();
        let at = event.observed_at;
        let rel_path = display_path(&ctx.paths.strip_base(&event.path));

        let limited = LimitKind::CHECK_ORDER
            .into_iter()
            .find(|kind| ctx.hits.above_limit(&rule, &event.path, *kind, at))
            .map(|kind| (kind, ctx.hits.describe(&rule, &event.path, kind)));
        let access_only = event.kind == ChangeKind::Modified
            && !event.synthetic
            && !recently_modified(&event.path, at, ctx.config.modify_slack());
        if !access_only {
            ctx.hits.record(&rule, &event.path, event.kind, "", at);
        }

        if let Some((kind, summary)) = &limited {
            info!(
                target: "rulewatch::actions",
                tenant,
                rule_id = %rule.rule_id,
                path = %rel_path,
                limit = %kind,
                "skipping action above limit: {summary}"
            );
            ctx.workflow_log
                .warn(
                    tenant,
                    format!(
                        "skip {} for {} {rel_path} on {target}: {kind} hit: {summary}",
                        rule.action, event.kind
                    ),
                )
                .await;
        }
        if access_only {
            debug!(target: "rulewatch::actions", tenant, path = %rel_path, "ignoring access time only modification");
            return ActionOutcome::Skipped(SkipReason::AccessTimeOnly);
        }
        if let Some((kind, _)) = limited {
            return ActionOutcome::Skipped(kind.into());
        }

        let settle_secs = rule.settle().as_secs_f64();
        if settle_secs > 0.0 && !self.wait_to_settle(&event, &rule, settle_secs, &rel_path).await {
            info!(target: "rulewatch::actions", tenant, path = %rel_path, "settle wait interrupted by shutdown");
            return ActionOutcome::Cancelled;
        }

        ctx.workflow_log
            .info(
                tenant,
                format!(
                    "handle {} for {} {rel_path} on {target}",
                    rule.action, event.kind
                ),
            )
            .await;
        match rule.action {
            RuleAction::Submit => self.run_submit(&event, &rule).await,
            RuleAction::Command => self.run_command(&event, &rule).await,
            RuleAction::TriggerCreated | RuleAction::TriggerModified | RuleAction::TriggerDeleted => {
                let kind = rule
                    .action
                    .trigger_kind()
                    .unwrap_or(ChangeKind::Created);
                self.run_trigger(&event, &rule, kind).await
            }
        }
    }

    /// Sleep until no hit on the event path is younger than the settle time.
    /// Returns false when cancelled first.
    async fn wait_to_settle(&self, event: &FsEvent, rule: &Rule, settle_secs: f64, rel_path: &str) -> bool {
        let ctx = &self.ctx;
        let mut at = event.observed_at;
        let mut wait = settle_secs;
        while wait > 0.0 {
            debug!(target: "rulewatch::actions", tenant = %rule.tenant, path = %rel_path, wait, "waiting for path to settle");
            ctx.workflow_log
                .info(&rule.tenant, format!("wait {wait:.3}s for {rel_path} to settle"))
                .await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return false,
                _ = tokio::time::sleep(Duration::from_secs_f64(wait)) => {}
            }
            at = advance(at, wait);
            wait = ctx.hits.time_to_settle(rule, &event.path, settle_secs, at);
        }
        true
    }

    async fn run_command(&self, event: &FsEvent, rule: &Rule) -> ActionOutcome {
        let ctx = &self.ctx;
        let tenant = rule.tenant.as_str();
        let Some((command, rest)) = rule.arguments.split_first() else {
            ctx.workflow_log
                .error(tenant, format!("command rule {} has no command", rule.rule_id))
                .await;
            return ActionOutcome::Failed("command rule without arguments".into());
        };

        let expand = ExpansionMap::for_event(event, rule, &ctx.layout);
        let args: Vec<String> = rest.iter().map(|arg| expand.apply(arg)).collect();
        ctx.workflow_log
            .info(tenant, format!("run command {command} {}", args.join(" ")))
            .await;

        match ctx
            .collaborators
            .commands
            .run(command, &args, &rule.owner, tenant)
            .await
        {
            Ok(output) if output.success() => {
                info!(target: "rulewatch::actions", tenant, command = %command, "command finished");
                ctx.workflow_log
                    .info(tenant, format!("command {command} succeeded: {}", output.stdout.trim()))
                    .await;
                ActionOutcome::Dispatched
            }
            Ok(output) => {
                warn!(
                    target: "rulewatch::actions",
                    tenant,
                    command = %command,
                    return_code = output.return_code,
                    "command exited with non-zero status"
                );
                ctx.workflow_log
                    .warn(
                        tenant,
                        format!(
                            "command {command} failed with code {}: {}",
                            output.return_code,
                            output.stderr.trim()
                        ),
                    )
                    .await;
                ActionOutcome::Failed(format!(
                    "{command} exited with code {}",
                    output.return_code
                ))
            }
            Err(err) => {
                error!(target: "rulewatch::actions", tenant, command = %command, error = %err, "command failed");
                ctx.workflow_log
                    .error(tenant, format!("command {command} failed: {err}"))
                    .await;
                ActionOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Whether the file at `path` was modified around `at` rather than only
/// read. Missing files count as modified.
pub fn recently_modified(path: &Path, at: DateTime<Utc>, slack: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return true;
    };
    let (Ok(modified), Ok(accessed)) = (meta.modified(), meta.accessed()) else {
        return true;
    };
    if modified == accessed {
        return true;
    }
    let slack = TimeDelta::from_std(slack).unwrap_or(TimeDelta::zero());
    DateTime::<Utc>::from(modified) > at - slack
}
