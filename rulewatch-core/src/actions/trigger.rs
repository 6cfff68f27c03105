use std::path::{Component, Path, PathBuf};

use tracing::{info, warn};

use super::{ActionHandler, ActionOutcome};
use crate::actions::expand::ExpansionMap;
use crate::event::{ChainLink, ChangeKind, FsEvent, format_chain};
use crate::paths::display_path;
use crate::rules::Rule;

/// Result of extending an event's lineage with one more link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainStep {
    Extended(Vec<ChainLink>),
    /// The link already occurs in the lineage; carries the full chain
    /// including the rejected link.
    Cycle(Vec<ChainLink>),
}

pub fn extend_chain(parent: &FsEvent, path: &Path, kind: ChangeKind) -> ChainStep {
    let mut chain = parent.lineage();
    let link = ChainLink::new(path, kind);
    let cycle = chain.contains(&link);
    chain.push(link);
    if cycle {
        ChainStep::Cycle(chain)
    } else {
        ChainStep::Extended(chain)
    }
}

impl ActionHandler {
    pub(super) async fn run_trigger(&self, event: &FsEvent, rule: &Rule, kind: ChangeKind) -> ActionOutcome {
        let ctx = &self.ctx;
        let tenant = rule.tenant.as_str();
        let data_root = ctx.layout.tenant_data_root(tenant);
        let expand = ExpansionMap::for_event(event, rule, &ctx.layout);
        let escaped_root = glob::Pattern::escape(&display_path(&data_root));

        let mut dispatched = 0_usize;
        for argument in &rule.arguments {
            let filled = expand.apply(argument);
            ctx.workflow_log
                .info(tenant, format!("expanded argument {argument} to {filled}"))
                .await;

            let relative = filled.trim_start_matches('/');
            if Path::new(relative)
                .components()
                .any(|component| matches!(component, Component::ParentDir))
            {
                warn!(target: "rulewatch::actions", tenant, argument = %filled, "trigger target escapes the tenant root");
                ctx.workflow_log
                    .warn(tenant, format!("ignoring trigger target {filled} outside the tenant"))
                    .await;
                continue;
            }

            let pattern = format!("{escaped_root}/{relative}");
            let expanded = tokio::task::spawn_blocking({
                let pattern = pattern.clone();
                move || expand_targets(&pattern)
            })
            .await;
            let targets = match expanded {
                Ok(Ok(targets)) => targets,
                Ok(Err(err)) => {
                    warn!(target: "rulewatch::actions", tenant, pattern = %pattern, error = %err, "invalid trigger pattern");
                    ctx.workflow_log
                        .error(tenant, format!("invalid trigger target {filled}: {err}"))
                        .await;
                    return ActionOutcome::Failed(format!("invalid trigger target {filled}: {err}"));
                }
                Err(err) => {
                    warn!(target: "rulewatch::actions", tenant, pattern = %pattern, error = %err, "trigger expansion task failed");
                    return ActionOutcome::Failed(format!("expanding trigger target {filled} failed: {err}"));
                }
            };

            for (path, is_directory) in targets {
                let rel_path = display_path(&ctx.paths.strip_base(&path));
                match extend_chain(event, &path, kind) {
                    ChainStep::Cycle(chain) => {
                        let chain_str = format_chain(&chain);
                        warn!(target: "rulewatch::actions", tenant, rule_id = %rule.rule_id, "breaking trigger cycle {chain_str}");
                        let files_home = display_path(&ctx.layout.files_home);
                        ctx.workflow_log
                            .warn(
                                tenant,
                                format!("breaking trigger cycle {}", chain_str.replace(&files_home, "")),
                            )
                            .await;
                    }
                    ChainStep::Extended(chain) => {
                        let synthetic = FsEvent::synthetic(path.clone(), kind, is_directory, chain);
                        info!(target: "rulewatch::actions", tenant, change = %kind, path = %path.display(), "trigger synthetic event");
                        ctx.workflow_log
                            .info(tenant, format!("trigger {kind} event on {rel_path}"))
                            .await;
                        if !ctx.sink.dispatch(synthetic) {
                            return ActionOutcome::Cancelled;
                        }
                        dispatched += 1;
                    }
                }
            }
        }

        info!(target: "rulewatch::actions", tenant, rule_id = %rule.rule_id, dispatched, "trigger action finished");
        ActionOutcome::Dispatched
    }
}

/// Paths matching `pattern` with whether each is a directory.
fn expand_targets(pattern: &str) -> Result<Vec<(PathBuf, bool)>, glob::PatternError> {
    let mut targets = Vec::new();
    for entry in glob::glob(pattern)? {
        match entry {
            Ok(path) => {
                let is_directory = path.is_dir();
                targets.push((path, is_directory));
            }
            Err(err) => {
                warn!(target: "rulewatch::actions", error = %err, "unreadable path while expanding trigger");
            }
        }
    }
    Ok(targets)
}
