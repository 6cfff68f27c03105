use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rulewatch_config::{ConfigGuardRailError, ConfigLoadError, ConfigLoader, EnvConfig};
use tempfile::TempDir;

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("rulewatch.toml");
    fs::write(&path, contents).expect("write config");
    path
}

fn homes(dir: &Path) -> String {
    format!(
        "[paths]\ntenant_home = \"{}\"\nfiles_home = \"{}\"\npatterns_home = \"{}\"\n",
        dir.join("meta").display(),
        dir.join("files").display(),
        dir.display(),
    )
}

#[test]
fn file_values_and_defaults_compose() {
    let dir = tempfile::tempdir().unwrap();
    let contents = format!(
        r#"{}
rule_filename = "rules.json"

[logging]
level = "warning"

[engine]
max_concurrent_actions = 8
miss_cache_ttl_ms = 1000

[workflow_log]
max_bytes = 1024

[supervisor]
child_shutdown_grace = "1m 30s"

[access]
allow_all = true

[commands.report]
program = "/usr/local/bin/report"
args = ["src", "dst"]
"#,
        homes(dir.path())
    );
    let path = write_config(&dir, &contents);

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .expect("config loads");
    let config = load.config;

    assert!(config.enabled);
    assert_eq!(config.paths.rule_filename, "rules.json");
    assert_eq!(config.paths.job_spool, dir.path().join("meta").join(".spool"));
    assert_eq!(config.logging.level.as_deref(), Some("warning"));
    assert_eq!(config.engine.max_concurrent_actions, 8);
    assert_eq!(config.engine.miss_cache_ttl_ms, 1000);
    assert_eq!(config.engine.main_loop_tick_ms, 1_000);
    assert_eq!(config.workflow_log.max_bytes, 1024);
    assert_eq!(config.workflow_log.backups, 1);
    assert_eq!(config.supervisor.child_shutdown_grace, Duration::from_secs(90));
    assert!(config.access.allow_all);
    assert_eq!(config.commands["report"].args, vec!["src", "dst"]);
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert!(load.warnings.is_empty(), "{:?}", load.warnings);

    let layout = config.layout();
    assert_eq!(layout.rule_file("alpha"), dir.path().join("meta/alpha/rules.json"));
}

#[test]
fn environment_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, &format!("enabled = true\n{}", homes(dir.path())));
    let env = EnvConfig {
        enabled: Some(false),
        files_home: Some(dir.path().join("other")),
        log_level: Some("debug".into()),
        ..EnvConfig::default()
    };

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(env)
        .load()
        .unwrap()
        .config;

    assert!(!config.enabled);
    assert_eq!(config.paths.files_home, dir.path().join("other"));
    assert_eq!(config.paths.tenant_home, dir.path().join("meta"));
    assert_eq!(config.logging.level.as_deref(), Some("debug"));
}

#[test]
fn config_path_from_environment_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let env = EnvConfig {
        config_path: Some(missing.clone()),
        ..EnvConfig::default()
    };

    let err = ConfigLoader::new().with_env(env).load().unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { path } if path == missing));
}

#[test]
fn environment_only_configuration_warns() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        tenant_home: Some(dir.path().join("meta")),
        files_home: Some(dir.path().join("files")),
        ..EnvConfig::default()
    };

    let load = ConfigLoader::new().with_env(env).load().unwrap();
    assert!(load.config.metadata.config_path.is_none());
    let messages: Vec<_> = load.warnings.iter().map(|w| w.message.as_str()).collect();
    assert!(messages.iter().any(|m| m.contains("No rulewatch.toml")));
    assert!(messages.iter().any(|m| m.contains("patterns_home")));
}

#[test]
fn guard_rails_reject_unusable_layouts() {
    let dir = tempfile::tempdir().unwrap();

    let shared = write_config(
        &dir,
        "[paths]\ntenant_home = \"/srv/x\"\nfiles_home = \"/srv/x\"\n",
    );
    let err = ConfigLoader::new()
        .with_config_path(&shared)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::SharedHome { .. })
    ));

    let missing = write_config(&dir, "[paths]\ntenant_home = \"/srv/meta\"\n");
    let err = ConfigLoader::new()
        .with_config_path(&missing)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::MissingPath { field: "files_home", .. })
    ));

    let zero = write_config(
        &dir,
        &format!("{}\n[engine]\nmax_concurrent_actions = 0\n", homes(dir.path())),
    );
    let err = ConfigLoader::new()
        .with_config_path(&zero)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::GuardRail(ConfigGuardRailError::NoActionSlots)));
}

#[test]
fn malformed_values_are_reported() {
    let dir = tempfile::tempdir().unwrap();

    let bad_grace = write_config(
        &dir,
        &format!("{}\n[supervisor]\nchild_shutdown_grace = \"soon\"\n", homes(dir.path())),
    );
    let err = ConfigLoader::new()
        .with_config_path(&bad_grace)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::InvalidDuration { .. }));

    let bad_toml = write_config(&dir, "[paths\n");
    let err = ConfigLoader::new()
        .with_config_path(&bad_toml)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::Parse { .. }));

    let bad_level = write_config(
        &dir,
        &format!("{}\n[logging]\nlevel = \"chatty\"\n", homes(dir.path())),
    );
    let err = ConfigLoader::new()
        .with_config_path(&bad_level)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(ConfigGuardRailError::InvalidLogLevel { .. })
    ));
}

#[test]
fn missing_writable_overlay_is_only_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        writable_home: Some(dir.path().join("nowhere")),
        ..EnvConfig::default()
    };
    let path = write_config(&dir, &homes(dir.path()));

    let load = ConfigLoader::new()
        .with_config_path(&path)
        .with_env(env)
        .load()
        .unwrap();
    assert_eq!(load.warnings.len(), 1);
    assert!(load.warnings.items[0].message.contains("writable overlay"));
    assert_eq!(
        load.config.layout().writable_home,
        Some(dir.path().join("nowhere"))
    );
}
