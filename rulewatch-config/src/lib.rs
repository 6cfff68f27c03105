//! Configuration library for rulewatch.
//!
//! Resolves the daemon configuration from an optional TOML file, a `.env`
//! file and `RULEWATCH_*` environment variables, then applies guard rails.
//! The engine knobs are the core's own [`EngineConfig`] so the file maps
//! one-to-one onto what the supervisors run with.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{
    AccessConfig, CommandConfig, Config, ConfigMetadata, LoggingConfig, PathsConfig,
    SupervisorConfig,
};
pub use rulewatch_core::config::{EngineConfig, WorkflowLogConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
