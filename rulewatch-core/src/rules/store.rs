use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::{Rule, TargetPattern};
use crate::config::Layout;
use crate::error::{EngineError, Result};
use crate::event::ChangeKind;
use crate::paths::display_path;

/// Rules sharing one absolute target pattern, in load order.
#[derive(Clone, Debug)]
pub struct RuleEntry {
    pub pattern: TargetPattern,
    pub rules: Vec<Arc<Rule>>,
}

/// Mapping from absolute target pattern to the rules watching it.
///
/// Entries never hold an empty rule list. Every mutation bumps
/// [`RuleMap::generation`].
#[derive(Clone, Debug, Default)]
pub struct RuleMap {
    entries: BTreeMap<String, RuleEntry>,
    generation: u64,
}

impl RuleMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rule_count(&self) -> usize {
        self.entries.values().map(|entry| entry.rules.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RuleEntry)> {
        self.entries
            .iter()
            .map(|(target, entry)| (target.as_str(), entry))
    }

    pub fn get(&self, target: &str) -> Option<&RuleEntry> {
        self.entries.get(target)
    }

    pub fn rules_for_tenant(&self, tenant: &str) -> Vec<Arc<Rule>> {
        self.entries
            .values()
            .flat_map(|entry| entry.rules.iter())
            .filter(|rule| rule.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Every tenant with at least one installed rule.
    pub fn tenants(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|entry| entry.rules.iter())
            .map(|rule| rule.tenant.clone())
            .collect()
    }

    /// Whether any rule belongs to `tenant` or one of its nested tenants.
    pub fn has_rules_under(&self, tenant: &str) -> bool {
        let nested = format!("{tenant}/");
        self.entries
            .values()
            .flat_map(|entry| entry.rules.iter())
            .any(|rule| rule.tenant == tenant || rule.tenant.starts_with(&nested))
    }

    pub fn insert(&mut self, target: String, pattern: TargetPattern, rule: Arc<Rule>) {
        self.entries
            .entry(target)
            .or_insert_with(|| RuleEntry {
                pattern,
                rules: Vec::new(),
            })
            .rules
            .push(rule);
        self.generation += 1;
    }

    /// Drop every rule owned by exactly `tenant`, leaving parent and nested
    /// tenants untouched. Returns the number of rules removed.
    pub fn remove_tenant(&mut self, tenant: &str) -> usize {
        self.remove_where(|rule| rule.tenant == tenant)
    }

    /// Drop every rule owned by `tenant` or a tenant nested below it.
    pub fn remove_tenant_tree(&mut self, tenant: &str) -> usize {
        let nested = format!("{tenant}/");
        self.remove_where(|rule| rule.tenant == tenant || rule.tenant.starts_with(&nested))
    }

    fn remove_where(&mut self, predicate: impl Fn(&Rule) -> bool) -> usize {
        let mut removed = 0;
        self.entries.retain(|target, entry| {
            let before = entry.rules.len();
            entry.rules.retain(|rule| !predicate(rule));
            removed += before - entry.rules.len();
            if entry.rules.is_empty() {
                debug!(target: "rulewatch::rules", pattern = %target, "removing empty target pattern");
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.generation += 1;
        }
        removed
    }

    /// Atomically swap `tenant`'s rules for `rules`.
    fn replace_tenant(
        &mut self,
        tenant: &str,
        rules: Vec<(String, TargetPattern, Arc<Rule>)>,
    ) -> usize {
        let removed = self.remove_tenant(tenant);
        for (target, pattern, rule) in rules {
            self.insert(target, pattern, rule);
        }
        self.generation += 1;
        removed
    }
}

/// Outcome of applying one rule-file event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub tenant: String,
    pub loaded: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Owns rule-file loading for one supervisor and writes the shared map.
pub struct RuleStore {
    layout: Arc<Layout>,
    map: Arc<RwLock<RuleMap>>,
}

impl fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("RuleStore");
        debug.field("tenant_home", &self.layout.tenant_home);
        match self.map.try_read() {
            Some(map) => debug.field("rule_count", &map.rule_count()),
            None => debug.field("map", &"<locked>"),
        };
        debug.finish()
    }
}

impl RuleStore {
    pub fn new(layout: Arc<Layout>, map: Arc<RwLock<RuleMap>>) -> Self {
        Self { layout, map }
    }

    pub fn map(&self) -> Arc<RwLock<RuleMap>> {
        Arc::clone(&self.map)
    }

    /// Reload or drop the rules of the tenant owning `path`.
    ///
    /// A rule file that cannot be read or parsed counts as empty.
    pub fn apply_rule_file_event(&self, path: &Path, kind: ChangeKind) -> Result<ReloadSummary> {
        let tenant = self.layout.tenant_of_rule_file(path).ok_or_else(|| {
            EngineError::InvalidRule(format!("{} is not a tenant rule file", path.display()))
        })?;

        let (rules, skipped) = if kind == ChangeKind::Deleted {
            (Vec::new(), 0)
        } else {
            match fs::read(path) {
                Ok(bytes) => {
                    let (rules, warnings) = parse_rule_file(&bytes, &tenant);
                    for warning in &warnings {
                        warn!(target: "rulewatch::rules", tenant = %tenant, path = %path.display(), "{warning}");
                    }
                    (rules, warnings.len())
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(target: "rulewatch::rules", path = %path.display(), "rule file vanished before load");
                    (Vec::new(), 0)
                }
                Err(err) => {
                    error!(target: "rulewatch::rules", path = %path.display(), error = %err, "failed to read rule file");
                    (Vec::new(), 0)
                }
            }
        };

        let data_root = self.layout.tenant_data_root(&tenant);
        let mut compiled = Vec::with_capacity(rules.len());
        let mut skipped = skipped;
        for rule in rules {
            let target = display_path(&data_root.join(&rule.path));
            match TargetPattern::compile(&target) {
                Ok(pattern) => compiled.push((target, pattern, Arc::new(rule))),
                Err(err) => {
                    warn!(target: "rulewatch::rules", tenant = %tenant, rule_id = %rule.rule_id, error = %err, "skipping rule with invalid target pattern");
                    skipped += 1;
                }
            }
        }

        let loaded = compiled.len();
        let removed = self.map.write().replace_tenant(&tenant, compiled);

        info!(
            target: "rulewatch::rules",
            tenant = %tenant,
            change = %kind,
            loaded,
            removed,
            skipped,
            "refreshed tenant rules"
        );

        Ok(ReloadSummary {
            tenant,
            loaded,
            removed,
            skipped,
        })
    }

    pub fn remove_tenant(&self, tenant: &str) -> usize {
        let removed = self.map.write().remove_tenant(tenant);
        info!(target: "rulewatch::rules", tenant = %tenant, removed, "dropped tenant rules");
        removed
    }

    pub fn remove_tenant_tree(&self, tenant: &str) -> usize {
        let removed = self.map.write().remove_tenant_tree(tenant);
        info!(target: "rulewatch::rules", tenant, removed, "dropped rules of tenant tree");
        removed
    }
}

/// Decode a rule file into the valid rules it holds for `tenant`.
///
/// The file is a JSON list; each malformed, invalid, foreign-tenant or
/// duplicate record is skipped and reported in the returned warnings.
pub fn parse_rule_file(bytes: &[u8], tenant: &str) -> (Vec<Rule>, Vec<String>) {
    let mut warnings = Vec::new();
    let records: Vec<serde_json::Value> = match serde_json::from_slice(bytes) {
        Ok(records) => records,
        Err(err) => {
            warnings.push(format!("rule file is not a list of records: {err}"));
            return (Vec::new(), warnings);
        }
    };

    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let mut rule: Rule = match serde_json::from_value(record) {
            Ok(rule) => rule,
            Err(err) => {
                warnings.push(format!("skipping malformed rule record #{index}: {err}"));
                continue;
            }
        };

        if rule.tenant.is_empty() {
            rule.tenant = tenant.to_string();
        } else if rule.tenant != tenant {
            warnings.push(format!(
                "skipping rule {} claiming tenant {} in rule file of {tenant}",
                rule.rule_id, rule.tenant
            ));
            continue;
        }

        if let Err(err) = rule.validate() {
            warnings.push(format!("skipping rule record #{index}: {err}"));
            continue;
        }

        if !seen.insert(rule.rule_id.clone()) {
            warnings.push(format!("skipping duplicate rule id {}", rule.rule_id));
            continue;
        }

        rules.push(rule);
    }

    (rules, warnings)
}
