use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::{ActionHandler, ActionOutcome};
use crate::actions::expand::ExpansionMap;
use crate::codec::save_record;
use crate::collaborators::ParamRange;
use crate::error::{EngineError, Result};
use crate::event::{ChangeKind, FsEvent};
use crate::rules::Rule;

const ENVIRONMENT_MARKER: &str = "::ENVIRONMENT::";

/// Event summary stored with a pending job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_directory: bool,
    pub observed_at: DateTime<Utc>,
    pub synthetic: bool,
}

impl From<&FsEvent> for PendingEvent {
    fn from(event: &FsEvent) -> Self {
        Self {
            path: event.path.clone(),
            kind: event.kind,
            is_directory: event.is_directory,
            observed_at: event.observed_at,
            synthetic: event.synthetic,
        }
    }
}

/// Record written to the tenant's pending-jobs directory per submitted job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingJob {
    pub job_id: String,
    pub owner: String,
    pub rule: Rule,
    pub event: PendingEvent,
}

/// Inclusive linear values of `range`. A zero step yields only `start`, as
/// does a step pointing away from `stop`.
pub fn parameter_values(range: &ParamRange) -> Vec<f64> {
    if range.step == 0.0 || !range.step.is_finite() {
        return vec![range.start];
    }
    let steps = ((range.stop - range.start) / range.step + 1e-9).floor();
    if steps.is_nan() || steps < 0.0 {
        return vec![range.start];
    }
    (0..=steps as u64)
        .map(|i| range.start + i as f64 * range.step)
        .collect()
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Cartesian product of all swept variables, in variable name order. No
/// variables gives a single empty tuple.
pub fn parameter_tuples(over: &BTreeMap<String, ParamRange>) -> Vec<Vec<(String, String)>> {
    let mut tuples: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for (name, range) in over {
        let values = parameter_values(range);
        tuples = tuples
            .into_iter()
            .flat_map(|tuple| {
                values.iter().map(move |value| {
                    let mut next = tuple.clone();
                    next.push((name.clone(), format_value(*value)));
                    next
                })
            })
            .collect();
    }
    tuples
}

/// Expand trigger tokens in `template` and inject the environment section.
///
/// Rule variables come first; sweep parameters follow unless a rule
/// variable already uses the name.
pub fn fill_template(
    template: &str,
    environment: &BTreeMap<String, String>,
    params: &[(String, String)],
    expand: &ExpansionMap,
) -> String {
    let mut text = expand.apply(template);

    let mut lines = String::new();
    for (name, value) in environment {
        lines.push_str(&format!("\n{name}={value}"));
    }
    for (name, value) in params {
        if !environment.contains_key(name) {
            lines.push_str(&format!("\n{name}={value}"));
        }
    }

    match text.find(ENVIRONMENT_MARKER) {
        Some(index) => text.insert_str(index + ENVIRONMENT_MARKER.len(), &lines),
        None => {
            if !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(ENVIRONMENT_MARKER);
            text.push_str(&lines);
            text.push('\n');
        }
    }
    text
}

impl ActionHandler {
    pub(super) async fn run_submit(&self, event: &FsEvent, rule: &Rule) -> ActionOutcome {
        let tenant = rule.tenant.as_str();
        match self.submit_jobs(event, rule).await {
            Ok(job_ids) => {
                info!(target: "rulewatch::actions", tenant, rule_id = %rule.rule_id, jobs = job_ids.len(), "submitted jobs");
                ActionOutcome::Dispatched
            }
            Err(err) => {
                error!(target: "rulewatch::actions", tenant, rule_id = %rule.rule_id, error = %err, "job submission failed");
                self.ctx
                    .workflow_log
                    .error(tenant, format!("submit for rule {} failed: {err}", rule.rule_id))
                    .await;
                ActionOutcome::Failed(err.to_string())
            }
        }
    }

    async fn submit_jobs(&self, event: &FsEvent, rule: &Rule) -> Result<Vec<String>> {
        let ctx = &self.ctx;
        let tenant = rule.tenant.as_str();
        // Removed on drop, including every early return below.
        let workdir = tempfile::Builder::new()
            .prefix("rulewatch-submit-")
            .tempdir()?;
        let expand = ExpansionMap::for_event(event, rule, &ctx.layout);

        let tuples = match &rule.pattern_id {
            Some(pattern_id) => {
                let pattern = ctx
                    .collaborators
                    .patterns
                    .get_pattern(pattern_id)
                    .await?
                    .ok_or_else(|| EngineError::PatternNotFound(pattern_id.clone()))?;
                parameter_tuples(&pattern.parameterize_over)
            }
            None => vec![Vec::new()],
        };

        let mut job_ids = Vec::new();
        for (template_index, template) in rule.templates.iter().enumerate() {
            for (tuple_index, tuple) in tuples.iter().enumerate() {
                let filled = fill_template(template, &rule.environment_vars, tuple, &expand);
                let job_file = workdir
                    .path()
                    .join(format!("job-{template_index}-{tuple_index}.mRSL"));
                std::fs::write(&job_file, filled).map_err(|err| EngineError::io(&job_file, err))?;

                let receipt = ctx
                    .collaborators
                    .submitter
                    .submit(&job_file, &rule.owner, tenant)
                    .await?;
                self.record_pending(&receipt.job_id, event, rule)?;
                ctx.workflow_log
                    .info(
                        tenant,
                        format!("submitted job {} for rule {}: {}", receipt.job_id, rule.rule_id, receipt.message),
                    )
                    .await;
                job_ids.push(receipt.job_id);
            }
        }
        Ok(job_ids)
    }

    fn record_pending(&self, job_id: &str, event: &FsEvent, rule: &Rule) -> Result<()> {
        if job_id.is_empty() || Path::new(job_id).components().count() != 1 || job_id.starts_with('.') {
            return Err(EngineError::Submit(format!("unusable job id '{job_id}'")));
        }
        let dir = self.ctx.layout.pending_jobs_dir(&rule.tenant);
        std::fs::create_dir_all(&dir).map_err(|err| EngineError::io(&dir, err))?;
        let record = PendingJob {
            job_id: job_id.to_string(),
            owner: rule.owner.clone(),
            rule: rule.clone(),
            event: PendingEvent::from(event),
        };
        save_record(&record, &dir.join(job_id))
    }
}
