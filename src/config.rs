// Daemon settings file parser

//! Daemon settings parsing and validation
//!
//! This module handles loading the optional TOML settings file and validating
//! its contents. Trigger rules live in their own file and are handled by
//! [`crate::rules`]; the settings here only tune daemon behavior.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default daemon settings location, relative to the home directory.
pub const DEFAULT_SETTINGS_PATH: &str = ".config/wifiwatcher/config.toml";

/// Default trigger rules location, relative to the home directory.
pub const DEFAULT_RULES_PATH: &str = ".wifiwatcher";

/// Top-level settings structure.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Observer and logging options
    #[serde(default)]
    pub general: GeneralSettings,
    /// Script execution options
    #[serde(default)]
    pub dispatch: DispatchSettings,
}

/// Observer and logging options.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct GeneralSettings {
    /// Trigger rules file; defaults to `~/.wifiwatcher`
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    /// Wireless interface to watch; auto-detected when unset
    #[serde(default)]
    pub monitor_interface: Option<String>,
    /// Stability window before a transition is committed (seconds)
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Poll fallback interval for resampling wireless state (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// env_logger filter for operational logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Execution event log target; stdout when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Script execution options.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DispatchSettings {
    /// Global cap on simultaneously running scripts
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-execution timeout (seconds)
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    /// Shutdown drain budget for in-flight executions (seconds)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Bytes of captured stdout+stderr tail retained per execution
    #[serde(default = "default_output_tail_bytes")]
    pub output_tail_bytes: usize,
}

fn default_debounce_secs() -> u64 {
    2
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_drain_timeout_secs() -> u64 {
    10
}

fn default_output_tail_bytes() -> usize {
    2048
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            rules_file: None,
            monitor_interface: None,
            debounce_secs: default_debounce_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            script_timeout_secs: default_script_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            output_tail_bytes: default_output_tail_bytes(),
        }
    }
}

impl Settings {
    /// Resolved rules file path, expanding `~/` and falling back to the
    /// well-known default.
    pub fn rules_path(&self) -> PathBuf {
        match &self.general.rules_file {
            Some(p) => expand_tilde(p),
            None => home_path(DEFAULT_RULES_PATH),
        }
    }
}

/// Load settings from `path`, or from the default location when `path` is
/// `None`. A missing default file yields built-in defaults; an explicitly
/// given path must exist.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (resolved, required) = match path {
        Some(p) => (expand_tilde(p), true),
        None => (home_path(DEFAULT_SETTINGS_PATH), false),
    };

    if !resolved.exists() {
        if required {
            anyhow::bail!("settings file {} does not exist", resolved.display());
        }
        return Ok(Settings::default());
    }

    let contents = fs::read_to_string(&resolved)
        .with_context(|| format!("Failed to read settings file {}", resolved.display()))?;
    let settings: Settings = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse settings file {}", resolved.display()))?;

    validate_settings(&settings)?;
    Ok(settings)
}

/// Validate settings values.
fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.general.debounce_secs == 0 {
        anyhow::bail!("general.debounce_secs must be > 0");
    }
    if settings.general.poll_interval_secs == 0 {
        anyhow::bail!("general.poll_interval_secs must be > 0");
    }
    if settings.dispatch.max_concurrent == 0 {
        anyhow::bail!("dispatch.max_concurrent must be > 0");
    }
    if settings.dispatch.script_timeout_secs == 0 {
        anyhow::bail!("dispatch.script_timeout_secs must be > 0");
    }
    if let Some(iface) = &settings.general.monitor_interface {
        validate_interface_name(iface)?;
    }
    Ok(())
}

/// Validates that an interface name is safe to use in system paths.
/// Only allows alphanumeric characters, hyphens, and underscores.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Interface name cannot be empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Interface name contains invalid characters: '{}'. \
            Only alphanumeric, hyphens, and underscores are allowed",
            name
        );
    }
    Ok(())
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(dir) = home::home_dir() {
            return dir.join(rest);
        }
    }
    path.to_path_buf()
}

/// A path under the user's home directory, falling back to a relative path
/// when the home directory cannot be determined.
pub fn home_path(rel: &str) -> PathBuf {
    match home::home_dir() {
        Some(dir) => dir.join(rel),
        None => PathBuf::from(rel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_from_empty_toml() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.general.debounce_secs, 2);
        assert_eq!(settings.general.poll_interval_secs, 5);
        assert_eq!(settings.general.log_level, "info");
        assert_eq!(settings.dispatch.max_concurrent, 4);
        assert_eq!(settings.dispatch.script_timeout_secs, 30);
        assert_eq!(settings.dispatch.drain_timeout_secs, 10);
        assert_eq!(settings.dispatch.output_tail_bytes, 2048);
        assert!(settings.general.rules_file.is_none());
        assert!(settings.general.log_file.is_none());
    }

    #[test]
    fn parse_full_settings() {
        let toml = r#"
            [general]
            rules_file = "/etc/wifiwatcher/rules"
            monitor_interface = "wlp3s0"
            debounce_secs = 5
            poll_interval_secs = 10
            log_level = "debug"
            log_file = "/var/log/wifiwatcher.log"

            [dispatch]
            max_concurrent = 8
            script_timeout_secs = 60
            drain_timeout_secs = 5
            output_tail_bytes = 512
        "#;
        let settings: Settings = toml::from_str(toml).unwrap();
        validate_settings(&settings).unwrap();
        assert_eq!(
            settings.general.monitor_interface.as_deref(),
            Some("wlp3s0")
        );
        assert_eq!(settings.dispatch.max_concurrent, 8);
        assert_eq!(settings.rules_path(), PathBuf::from("/etc/wifiwatcher/rules"));
    }

    #[test]
    fn validation_rejects_zero_values() {
        let mut settings = Settings::default();
        settings.general.debounce_secs = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.dispatch.max_concurrent = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.dispatch.script_timeout_secs = 0;
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn validation_rejects_bad_interface_names() {
        assert!(validate_interface_name("wlan0").is_ok());
        assert!(validate_interface_name("wlp3s0").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wlan0; rm -rf /").is_err());
        assert!(validate_interface_name("../etc").is_err());
    }

    #[test]
    fn unknown_settings_keys_rejected() {
        let toml = r#"
            [general]
            debounce_seconds = 3
        "#;
        assert!(toml::from_str::<Settings>(toml).is_err());
    }

    #[test]
    fn load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch]\nmax_concurrent = 2").unwrap();
        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.dispatch.max_concurrent, 2);
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        assert!(load_settings(Some(Path::new("/nonexistent/wifiwatcher.toml"))).is_err());
    }

    #[test]
    fn expand_tilde_passthrough_for_absolute() {
        assert_eq!(
            expand_tilde(Path::new("/tmp/x")),
            PathBuf::from("/tmp/x")
        );
    }
}
