use std::collections::BTreeMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::Layout;
use crate::event::FsEvent;
use crate::paths::display_path;
use crate::rules::Rule;

static TOKEN_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+[A-Z]+\+").expect("expansion token regex should compile"));

/// Values substituted for `+TOKEN+` placeholders in rule arguments and job
/// templates.
///
/// Substitution is a single pass: values are never re-expanded, and unknown
/// tokens (notably `+JOBID+`, which the job backend fills) stay in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpansionMap {
    values: BTreeMap<&'static str, String>,
}

impl ExpansionMap {
    pub fn for_event(event: &FsEvent, rule: &Rule, layout: &Layout) -> Self {
        let path = event.path.as_path();
        let data_root = layout.tenant_data_root(&rule.tenant);
        let rel_path = path
            .strip_prefix(&data_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| layout.path_mapper().strip_base(path));

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let parent = |p: &Path| p.parent().map(display_path).unwrap_or_default();

        let mut values = BTreeMap::new();
        values.insert("+TRIGGERPATH+", display_path(path));
        values.insert("+TRIGGERRELPATH+", display_path(&rel_path));
        values.insert("+TRIGGERDIRNAME+", parent(path));
        values.insert("+TRIGGERRELDIRNAME+", parent(&rel_path));
        values.insert("+TRIGGERFILENAME+", file_name);
        values.insert("+TRIGGERPREFIX+", prefix);
        values.insert("+TRIGGEREXTENSION+", extension);
        values.insert("+TRIGGERCHANGE+", event.kind.to_string());
        values.insert("+TRIGGERVGRIDNAME+", rule.tenant.clone());
        values.insert("+TRIGGERRUNAS+", rule.owner.clone());
        Self { values }
    }

    pub fn get(&self, token: &str) -> Option<&str> {
        self.values.get(token).map(String::as_str)
    }

    pub fn apply(&self, input: &str) -> String {
        TOKEN_PATTERN
            .replace_all(input, |caps: &Captures<'_>| {
                let token = &caps[0];
                self.get(token).unwrap_or(token).to_string()
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::ChangeKind;
    use crate::rules::RuleAction;

    fn rule() -> Rule {
        Rule {
            rule_id: "r".into(),
            tenant: "alpha".into(),
            owner: "alice".into(),
            path: "in/*.raw".into(),
            changes: vec![ChangeKind::Created],
            action: RuleAction::TriggerCreated,
            arguments: vec![],
            templates: vec![],
            rate_limit: String::new(),
            settle_time: String::new(),
            match_files: true,
            match_dirs: false,
            match_recursive: false,
            pattern_id: None,
            environment_vars: Default::default(),
        }
    }

    #[test]
    fn expands_every_trigger_token() {
        let layout = Layout::new("/meta", "/root");
        let event = FsEvent::new("/root/alpha/in/x.tar.gz", ChangeKind::Created, false);
        let map = ExpansionMap::for_event(&event, &rule(), &layout);

        assert_eq!(map.get("+TRIGGERPATH+"), Some("/root/alpha/in/x.tar.gz"));
        assert_eq!(map.get("+TRIGGERRELPATH+"), Some("in/x.tar.gz"));
        assert_eq!(map.get("+TRIGGERDIRNAME+"), Some("/root/alpha/in"));
        assert_eq!(map.get("+TRIGGERRELDIRNAME+"), Some("in"));
        assert_eq!(map.get("+TRIGGERFILENAME+"), Some("x.tar.gz"));
        assert_eq!(map.get("+TRIGGERPREFIX+"), Some("x.tar"));
        assert_eq!(map.get("+TRIGGEREXTENSION+"), Some(".gz"));
        assert_eq!(map.get("+TRIGGERCHANGE+"), Some("created"));
        assert_eq!(map.get("+TRIGGERVGRIDNAME+"), Some("alpha"));
        assert_eq!(map.get("+TRIGGERRUNAS+"), Some("alice"));
    }

    #[test]
    fn unknown_tokens_survive_and_values_are_not_reexpanded() {
        let layout = Layout::new("/meta", "/root");
        let event = FsEvent::new("/root/alpha/in/+TRIGGERRUNAS+", ChangeKind::Created, false);
        let map = ExpansionMap::for_event(&event, &rule(), &layout);

        assert_eq!(
            map.apply("out/+TRIGGERFILENAME+.+JOBID+.done"),
            "out/+TRIGGERRUNAS+.+JOBID+.done"
        );
    }
}
