use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use rulewatch_config::CommandConfig;
use rulewatch_core::collaborators::CommandOutput;
use rulewatch_core::commands::{CommandHandler, CommandInvocation, CommandRegistry, builtin_arg_form};
use rulewatch_core::error::{EngineError, Result};
use tokio::process::Command;
use tracing::debug;

/// Runs one configured program per invocation.
///
/// Positional arguments are passed through as-is. The owner, the tenant and
/// every mapped backend variable are exported as `RULEWATCH_*` variables.
#[derive(Debug, Clone)]
pub struct ExecCommand {
    program: PathBuf,
}

impl ExecCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

pub fn arg_env_name(var: &str) -> String {
    let cleaned: String = var
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("RULEWATCH_ARG_{cleaned}")
}

#[async_trait]
impl CommandHandler for ExecCommand {
    async fn invoke(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&invocation.args)
            .env("RULEWATCH_OWNER", &invocation.owner)
            .env("RULEWATCH_TENANT", &invocation.tenant)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (var, values) in &invocation.vars {
            cmd.env(arg_env_name(var), values.join(" "));
        }

        debug!(target: "rulewatch::actions", program = %self.program.display(), command = %invocation.command, "spawning command");
        let output = cmd.output().await.map_err(|err| {
            EngineError::Command(format!("failed to run {}: {err}", self.program.display()))
        })?;

        Ok(CommandOutput {
            return_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build the static command registry from the `[commands.*]` table.
///
/// Entries without `args` fall back to the variable names of the stock
/// command of the same name.
pub fn build_registry(commands: &BTreeMap<String, CommandConfig>) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    for (name, entry) in commands {
        let arg_names = if entry.args.is_empty() {
            builtin_arg_form(name)
                .map(|vars| vars.iter().map(|var| var.to_string()).collect())
                .unwrap_or_default()
        } else {
            entry.args.clone()
        };
        registry.register(name.clone(), arg_names, Arc::new(ExecCommand::new(&entry.program)));
    }
    registry
}
