pub mod error;

use std::fs;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use rulewatch_core::config::DEFAULT_RULE_FILENAME;
use tracing::debug;

use crate::models::sources::{EnvConfig, FileConfig};
use crate::models::{
    AccessConfig, Config, ConfigMetadata, LoggingConfig, PathsConfig, SupervisorConfig,
};
use crate::validation::{self, ConfigWarnings};

use self::error::ConfigLoadError;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("rulewatch.toml"),
        PathBuf::from("config/rulewatch.toml"),
        PathBuf::from("/etc/rulewatch/rulewatch.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Use these values instead of reading the process environment. No
    /// `.env` file is loaded in that case.
    pub env: Option<EnvConfig>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let (env_config, env_file_loaded) = match &self.options.env {
            Some(env) => (env.clone(), false),
            None => {
                let loaded = self.load_env_file()?;
                (EnvConfig::gather(), loaded)
            }
        };

        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) =
            self.compose_config(file_config, env_config, config_path, env_file_loaded)?;

        Ok(ConfigLoad { config, warnings })
    }

    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true),
            None => dotenvy::dotenv().map(|_| true),
        };
        result.or_else(|err| match err {
            dotenvy::Error::Io(_) => Ok(false),
            _ => Err(err.into()),
        })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let requested = self
            .options
            .config_path
            .clone()
            .or_else(|| env_config.config_path.clone());

        let path = match requested {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS.iter().find(|candidate| candidate.exists()) {
                Some(path) => path.clone(),
                None => return Ok((None, None)),
            },
        };

        debug!(path = %path.display(), "reading configuration file");
        let contents = fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
            path: path.clone(),
            source: err,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if config_path.is_none() {
            warnings.push_with_hint(
                "No rulewatch.toml detected; falling back to environment variables",
                "Pass --config or set RULEWATCH_CONF to point at a configuration file",
            );
        }

        let FileConfig {
            enabled: file_enabled,
            paths: file_paths,
            logging: file_logging,
            engine: file_engine,
            workflow_log: file_workflow_log,
            supervisor: file_supervisor,
            access: file_access,
            commands,
        } = file_config.unwrap_or_default();

        let tenant_home = env
            .tenant_home
            .or(file_paths.tenant_home)
            .unwrap_or_default();
        let job_spool = file_paths
            .job_spool
            .unwrap_or_else(|| tenant_home.join(".spool"));

        let paths = PathsConfig {
            files_home: env.files_home.or(file_paths.files_home).unwrap_or_default(),
            writable_home: env.writable_home.or(file_paths.writable_home),
            rule_filename: file_paths
                .rule_filename
                .unwrap_or_else(|| DEFAULT_RULE_FILENAME.to_string()),
            patterns_home: file_paths.patterns_home,
            tenant_home,
            job_spool,
        };

        let logging = LoggingConfig {
            level: env.log_level.or(file_logging.level),
            file: env.log_file.or(file_logging.file),
        };

        let supervisor = match file_supervisor.child_shutdown_grace {
            Some(raw) => SupervisorConfig {
                child_shutdown_grace: humantime::parse_duration(raw.trim()).map_err(|source| {
                    ConfigLoadError::InvalidDuration {
                        field: "supervisor.child_shutdown_grace",
                        value: raw.clone(),
                        source,
                    }
                })?,
            },
            None => SupervisorConfig::default(),
        };

        let config = Config {
            enabled: env.enabled.or(file_enabled).unwrap_or(true),
            paths,
            logging,
            engine: file_engine.unwrap_or_default(),
            workflow_log: file_workflow_log.unwrap_or_default(),
            supervisor,
            access: AccessConfig {
                allow_all: file_access.allow_all.unwrap_or(false),
            },
            commands,
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };

        let guard_warnings = validation::apply_guard_rails(&config)?;
        warnings.extend(guard_warnings);

        Ok((config, warnings))
    }
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
