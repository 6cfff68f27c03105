//! Static registry of backend commands available to `command` rules.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::collaborators::{CommandOutput, CommandRunner};
use crate::error::{EngineError, Result};

/// Backend variable names of the stock command set.
pub const BUILTIN_ARG_FORMS: &[(&str, &[&str])] = &[
    ("pack", &["src", "dst"]),
    ("unpack", &["src", "dst"]),
    ("zip", &["src", "dst"]),
    ("unzip", &["src", "dst"]),
    ("tar", &["src", "dst"]),
    ("untar", &["src", "dst"]),
    ("cp", &["src", "dst"]),
    ("mv", &["src", "dst"]),
    ("rm", &["path"]),
    ("rmdir", &["path"]),
    ("truncate", &["path"]),
    ("touch", &["path"]),
    ("mkdir", &["path"]),
    ("submit", &["path"]),
    ("canceljob", &["job_id"]),
    ("resubmit", &["job_id"]),
    ("jobaction", &["job_id", "action"]),
    ("liveio", &["action", "src", "dst", "job_id"]),
    ("mqueue", &["queue", "action", "msg_id", "msg"]),
];

pub fn builtin_arg_form(command: &str) -> Option<&'static [&'static str]> {
    BUILTIN_ARG_FORMS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, vars)| *vars)
}

/// Everything a handler needs to execute one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub vars: BTreeMap<String, Vec<String>>,
    pub owner: String,
    pub tenant: String,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn invoke(&self, invocation: &CommandInvocation) -> Result<CommandOutput>;
}

struct CommandSpec {
    arg_names: Vec<String>,
    handler: Arc<dyn CommandHandler>,
}

/// Maps command names to handlers. Built once at startup.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandSpec>,
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .finish()
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        arg_names: Vec<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> &mut Self {
        self.commands
            .insert(name.into(), CommandSpec { arg_names, handler });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[async_trait]
impl CommandRunner for CommandRegistry {
    async fn run(&self, command: &str, args: &[String], owner: &str, tenant: &str) -> Result<CommandOutput> {
        let spec = self
            .commands
            .get(command)
            .ok_or_else(|| EngineError::UnknownCommand(command.to_string()))?;
        let invocation = CommandInvocation {
            command: command.to_string(),
            args: args.to_vec(),
            vars: map_args_to_vars(&spec.arg_names, args),
            owner: owner.to_string(),
            tenant: tenant.to_string(),
        };
        debug!(target: "rulewatch::actions", command, owner, vars = ?invocation.vars, "invoking command handler");
        spec.handler.invoke(&invocation).await
    }
}

/// Distribute positional `args` over `vars`. Surplus arguments extend the
/// first variable: `zip a b c dst` gives `src=[a,b,c]`, `dst=[dst]`.
pub fn map_args_to_vars(vars: &[String], args: &[String]) -> BTreeMap<String, Vec<String>> {
    let mut mapped: BTreeMap<String, Vec<String>> =
        vars.iter().map(|var| (var.clone(), Vec::new())).collect();
    let mut current = 0;
    for (index, arg) in args.iter().enumerate() {
        let Some(var) = vars.get(current) else {
            break;
        };
        if let Some(values) = mapped.get_mut(var) {
            values.push(arg.clone());
        }
        let remaining_args = args.len() - index - 1;
        if remaining_args < vars.len() - current {
            current += 1;
        }
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn surplus_arguments_extend_first_variable() {
        let vars = strings(&["src", "dst"]);
        let mapped = map_args_to_vars(&vars, &strings(&["a", "b", "c", "dst"]));
        assert_eq!(mapped["src"], strings(&["a", "b", "c"]));
        assert_eq!(mapped["dst"], strings(&["dst"]));

        let short = map_args_to_vars(&vars, &strings(&["only"]));
        assert_eq!(short["src"], strings(&["only"]));
        assert!(short["dst"].is_empty());

        let exact = map_args_to_vars(&strings(&["job_id", "action"]), &strings(&["42", "cancel"]));
        assert_eq!(exact["job_id"], strings(&["42"]));
        assert_eq!(exact["action"], strings(&["cancel"]));
    }

    #[test]
    fn builtin_forms_cover_stock_commands() {
        assert_eq!(builtin_arg_form("liveio"), Some(&["action", "src", "dst", "job_id"][..]));
        assert_eq!(builtin_arg_form("nope"), None);
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<CommandInvocation>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn invoke(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
            self.calls.lock().push(invocation.clone());
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_name() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = CommandRegistry::new();
        registry.register("cp", strings(&["src", "dst"]), recorder.clone());

        let output = registry
            .run("cp", &strings(&["a", "b"]), "alice", "alpha")
            .await
            .unwrap();
        assert!(output.success());
        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].vars["dst"], strings(&["b"]));
        assert_eq!(calls[0].tenant, "alpha");
        drop(calls);

        let err = registry.run("rm", &[], "alice", "alpha").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCommand(name) if name == "rm"));
    }
}
