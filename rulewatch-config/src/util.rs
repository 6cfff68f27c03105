use std::path::PathBuf;

const FLAG_ON: [&str; 4] = ["1", "true", "yes", "on"];
const FLAG_OFF: [&str; 4] = ["0", "false", "no", "off"];

/// On/off switch such as `RULEWATCH_ENABLED`. Unrecognised spellings count
/// as unset so the file value stays in effect.
pub fn flag_var(name: &str) -> Option<bool> {
    string_var(name).and_then(|raw| flag_value(&raw))
}

fn flag_value(raw: &str) -> Option<bool> {
    let matches = |forms: &[&str]| forms.iter().any(|form| raw.eq_ignore_ascii_case(form));
    if matches(&FLAG_ON) {
        Some(true)
    } else if matches(&FLAG_OFF) {
        Some(false)
    } else {
        None
    }
}

/// Non-blank value of `name`.
pub fn string_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn path_var(name: &str) -> Option<PathBuf> {
    string_var(name).map(PathBuf::from)
}

/// Canonical spelling of a log level accepted on the command line or in the
/// configuration file.
pub fn normalize_log_level(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" => Some("error"),
        _ => None,
    }
}
