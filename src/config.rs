//! Configuration handling
//!
//! Configuration is read from `--config <path>` or, by default,
//! `~/.config/iscenv/config.toml`. A missing file means defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::logging::LogLevel;
use crate::plugin::{namespaced_flag, ActivationPolicy, FlagValues, ManagerConfig, PluginArgs, PluginFlags};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding plugin executables
    pub plugin_dir: Option<PathBuf>,

    /// Plugins activated when a command names none
    pub plugins: Vec<String>,

    pub log_level: LogLevel,

    pub log_json: bool,

    pub call_timeout_secs: u64,

    pub handshake_timeout_secs: u64,

    pub shutdown_grace_millis: u64,

    pub activation_policy: ActivationPolicy,

    /// Plugin flag values, keyed `<plugin>-<flag>`
    pub flags: BTreeMap<String, toml::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_dir: None,
            plugins: Vec::new(),
            log_level: LogLevel::Info,
            log_json: false,
            call_timeout_secs: 60,
            handshake_timeout_secs: 10,
            shutdown_grace_millis: 5000,
            activation_policy: ActivationPolicy::FailFast,
            flags: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Returns the default config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "ontariosystems", "iscenv")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to load config: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the manager settings this configuration describes
    pub fn manager_config(&self) -> ManagerConfig {
        let plugin_dir = self
            .plugin_dir
            .clone()
            .unwrap_or_else(ManagerConfig::default_plugin_dir);

        let mut config = ManagerConfig::new(plugin_dir);
        config.args = PluginArgs {
            log_level: self.log_level,
            log_json: self.log_json,
        };
        config.policy = self.activation_policy;
        config.call_timeout = Duration::from_secs(self.call_timeout_secs);
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.shutdown_grace = Duration::from_millis(self.shutdown_grace_millis);
        config
    }

    /// Flag values from the `[flags]` table
    pub fn flag_settings(&self) -> Result<FlagSettings> {
        let mut settings = FlagSettings::default();
        for (key, value) in &self.flags {
            let value = serde_json::to_value(value)
                .with_context(|| format!("Unsupported value for flag {}", key))?;
            settings.configured.insert(key.to_lowercase(), value);
        }
        Ok(settings)
    }
}

/// Where plugin flag values come from
///
/// Keys are `<plugin>-<flag>`. A command-line override always wins; a
/// configured value applies only to flags declared with `has_config`;
/// anything else falls back to the declared default.
#[derive(Debug, Clone, Default)]
pub struct FlagSettings {
    overrides: BTreeMap<String, String>,
    configured: BTreeMap<String, Value>,
}

impl FlagSettings {
    /// Adds a `<plugin>-<flag>=<value>` command-line override
    pub fn add_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "Expected <plugin>-<flag>=<value>, got {:?}",
                assignment
            ))
        })?;

        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Missing flag name in {:?}",
                assignment
            )));
        }

        self.overrides.insert(key, value.to_string());
        Ok(())
    }

    /// Resolves every flag `plugin` declared
    pub fn resolve(&self, plugin: &str, declared: &PluginFlags) -> Result<FlagValues, ConfigError> {
        let mut values = FlagValues::new();

        for flag in declared.iter() {
            let key = namespaced_flag(plugin, &flag.name);

            let value = if let Some(raw) = self.overrides.get(&key) {
                coerce(&key, raw, &flag.default_value)?
            } else if let (true, Some(value)) = (flag.has_config, self.configured.get(&key)) {
                value.clone()
            } else {
                flag.default_value.clone()
            };

            values.insert(flag.name.clone(), value);
        }

        Ok(values)
    }

    /// Override keys that match no declared flag
    pub fn unknown_overrides<'a>(&'a self, known: &[String]) -> Vec<&'a str> {
        self.overrides
            .keys()
            .filter(|k| !known.contains(*k))
            .map(String::as_str)
            .collect()
    }
}

/// Parses a command-line string as the JSON type of the flag's default
fn coerce(key: &str, raw: &str, default: &Value) -> Result<Value, ConfigError> {
    let invalid = |kind: &str| {
        ConfigError::Invalid(format!("Flag {} expects {}, got {:?}", key, kind, raw))
    };

    match default {
        Value::Bool(_) => raw.parse::<bool>().map(Value::Bool).map_err(|_| invalid("a boolean")),
        Value::Number(n) if n.is_f64() => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| invalid("a number")),
        Value::Number(_) => raw
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| invalid("an integer")),
        Value::Array(_) | Value::Object(_) => {
            serde_json::from_str(raw).map_err(|_| invalid("JSON"))
        }
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn declared(flags: &[(&str, bool, Value)]) -> PluginFlags {
        let mut declared = PluginFlags::new();
        for (name, has_config, default) in flags {
            declared.add_flag(name, *has_config, default.clone(), "").unwrap();
        }
        declared
    }

    #[test]
    fn default_config() {
        let config = Config::default();

        assert_eq!(config.call_timeout_secs, 60);
        assert_eq!(config.activation_policy, ActivationPolicy::FailFast);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn parse_config() {
        let toml = r#"
plugin_dir = "/opt/iscenv/plugins"
plugins = ["csp", "license"]
log_level = "debug"
log_json = true
call_timeout_secs = 5
activation_policy = "skip_failed"

[flags]
csp-port = 8080
license-key = "abc"
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.plugins, vec!["csp", "license"]);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.activation_policy, ActivationPolicy::SkipFailed);

        let manager = config.manager_config();
        assert_eq!(manager.plugin_dir, PathBuf::from("/opt/iscenv/plugins"));
        assert_eq!(manager.call_timeout, Duration::from_secs(5));
        assert!(manager.args.log_json);
    }

    #[test]
    fn zero_timeout_is_invalid() {
        assert!(Config::parse("call_timeout_secs = 0").is_err());
    }

    #[test]
    fn load_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "plugins = [\"csp\"]\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.plugins, vec!["csp"]);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn resolution_precedence() {
        let config = Config::parse(
            r#"
[flags]
csp-port = 9090
csp-secret = "from-file"
"#,
        )
        .unwrap();
        let mut settings = config.flag_settings().unwrap();
        settings.add_override("csp-verbose=true").unwrap();

        let declared = declared(&[
            ("port", true, json!(8080)),
            ("secret", false, json!("default")),
            ("verbose", false, json!(false)),
        ]);

        let values = settings.resolve("csp", &declared).unwrap();
        assert_eq!(values["port"], json!(9090));
        assert_eq!(values["secret"], json!("default"));
        assert_eq!(values["verbose"], json!(true));
    }

    #[test]
    fn same_flag_name_in_two_plugins_stays_separate() {
        let mut settings = FlagSettings::default();
        settings.add_override("p2-timeout=99").unwrap();

        let p1 = declared(&[("timeout", true, json!(10))]);
        let p2 = declared(&[("timeout", true, json!(20))]);

        assert_eq!(settings.resolve("p1", &p1).unwrap()["timeout"], json!(10));
        assert_eq!(settings.resolve("p2", &p2).unwrap()["timeout"], json!(99));
    }

    #[test]
    fn override_coercion_errors() {
        let mut settings = FlagSettings::default();
        settings.add_override("csp-port=eighty").unwrap();

        let declared = declared(&[("port", false, json!(80))]);
        let err = settings.resolve("csp", &declared).unwrap_err();
        assert!(err.to_string().contains("expects an integer"));
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut settings = FlagSettings::default();
        assert!(settings.add_override("no-equals-sign").is_err());
        assert!(settings.add_override("=value").is_err());
    }

    #[test]
    fn unknown_overrides_are_reported() {
        let mut settings = FlagSettings::default();
        settings.add_override("csp-port=1").unwrap();
        settings.add_override("csp-typo=1").unwrap();

        let unknown = settings.unknown_overrides(&["csp-port".to_string()]);
        assert_eq!(unknown, vec!["csp-typo"]);
    }

    #[test]
    fn coerce_by_default_type() {
        assert_eq!(coerce("k", "1.5", &json!(0.5)).unwrap(), json!(1.5));
        assert_eq!(coerce("k", "[1,2]", &json!([])).unwrap(), json!([1, 2]));
        assert_eq!(coerce("k", "text", &Value::Null).unwrap(), json!("text"));
    }
}
