use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use rulewatch_config::{Config, ConfigLoad, ConfigLoader, ConfigWarnings};
use rulewatch_daemon::lifecycle::{self, ChildCommand, ChildPids};
use rulewatch_daemon::{logging, signals};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "rulewatchd")]
#[command(about = "Watch tenant directories and run the actions their rules describe")]
struct Cli {
    /// Log level override
    #[arg(value_parser = ["debug", "info", "warning", "error"])]
    log_level: Option<String>,

    /// Configuration file (defaults to rulewatch.toml, config/rulewatch.toml, /etc/rulewatch/rulewatch.toml)
    #[arg(long, env = "RULEWATCH_CONF")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the supervisor of a single tenant ("." for the root tenant)
    #[command(hide = true)]
    Tenant {
        name: String,
        /// Tenants with a process of their own, as a JSON list (root tenant only)
        #[arg(long, env = lifecycle::ROOT_EXCLUDE_ENV, hide = true)]
        root_exclude: Option<String>,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad { config, warnings } = loader.load().context("failed to load configuration")?;

    let log = logging::init(
        cli.log_level.as_deref(),
        config.logging.level.as_deref(),
        config.logging.file.as_deref(),
    )?;
    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    report_warnings(&warnings);

    if !config.enabled {
        bail!("rulewatch is disabled in configuration");
    }

    match cli.command {
        Some(Command::CheckConfig) => {
            describe(&config);
            Ok(())
        }
        Some(Command::Tenant { name, root_exclude }) => {
            let cancel = CancellationToken::new();
            let listener = signals::spawn_listener(cancel.clone(), log, || {})
                .context("failed to install signal handlers")?;
            let result = lifecycle::run_tenant(&config, &name, root_exclude.as_deref(), cancel.clone()).await;
            cancel.cancel();
            let _ = listener.await;
            result
        }
        None => {
            describe(&config);
            let cancel = CancellationToken::new();
            let pids = ChildPids::default();
            let forward = pids.clone();
            let listener = signals::spawn_listener(cancel.clone(), log, move || {
                forward.signal_all(Signal::SIGHUP)
            })
            .context("failed to install signal handlers")?;

            let command = ChildCommand::current_exe(
                config.metadata.config_path.as_deref(),
                cli.log_level.as_deref(),
            )
            .context("failed to locate rulewatchd executable")?;
            let result = lifecycle::run_parent(&config, command, cancel.clone(), pids).await;
            cancel.cancel();
            let _ = listener.await;
            result.map(|_| ())
        }
    }
}

fn report_warnings(warnings: &ConfigWarnings) {
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
}

fn describe(config: &Config) {
    info!(
        config = ?config.metadata.config_path,
        tenant_home = %config.paths.tenant_home.display(),
        files_home = %config.paths.files_home.display(),
        writable_home = ?config.paths.writable_home,
        rule_filename = %config.paths.rule_filename,
        commands = config.commands.len(),
        "configuration in effect"
    );
    info!(
        engine.max_concurrent_actions = config.engine.max_concurrent_actions,
        engine.miss_cache_ttl_ms = config.engine.miss_cache_ttl_ms,
        engine.activation_poll_ms = config.engine.activation_poll_ms,
        supervisor.child_shutdown_grace = ?config.supervisor.child_shutdown_grace,
        "engine configuration in effect"
    );
}
