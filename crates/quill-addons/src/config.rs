//! Addon runtime configuration.
//!
//! Precedence, highest first:
//!
//! 1. **Environment** (`QUILL_ADDONS_<KEY>`, e.g. `QUILL_ADDONS_WATCH=false`)
//! 2. **User** (`<home>/addons.toml`)
//! 3. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! `<home>` is `$QUILL_HOME` when set, otherwise `~/.quill`. Relative paths
//! in the merged config resolve against it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::script::ScriptLimits;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Prefix of environment overrides.
const ENV_PREFIX: &str = "QUILL_ADDONS_";

/// Name of the user config file inside the home directory.
pub const USER_CONFIG_FILE: &str = "addons.toml";

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: usize = 1_048_576;

/// Upper bound on `debounce_ms`.
const MAX_DEBOUNCE_MS: u64 = 60_000;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No home directory could be determined.
    #[error("could not determine home directory")]
    NoHomeDir,

    /// A config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path of the file.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A config file is not valid TOML or has the wrong shape.
    #[error("failed to parse config {path}: {source}")]
    ParseError {
        /// Path of the file, or `<embedded defaults>`.
        path: String,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value for {var}: {message}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Why it was rejected.
        message: String,
    },

    /// A value is out of range or fields contradict each other.
    #[error("invalid config field {field}: {message}")]
    ValidationError {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        message: String,
    },
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Resolved addon runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonConfig {
    /// Directory holding one sub-directory per plugin.
    pub plugins_dir: PathBuf,
    /// Directory holding one sub-directory per theme.
    pub themes_dir: PathBuf,
    /// JSON document holding persisted addon state.
    pub state_file: PathBuf,
    /// Reload addons when their files change.
    pub watch: bool,
    /// Quiet period before a burst of file events triggers a reload.
    pub debounce_ms: u64,
    /// Bound on source and stylesheet reads. `0` disables the bound.
    pub load_timeout_ms: u64,
    /// Script operation budget. `0` is unlimited.
    pub max_operations: u64,
    /// Script call-depth limit.
    pub max_call_levels: usize,
}

impl Default for AddonConfig {
    fn default() -> Self {
        Self {
            plugins_dir: PathBuf::from("plugins"),
            themes_dir: PathBuf::from("themes"),
            state_file: PathBuf::from("addons.json"),
            watch: true,
            debounce_ms: 300,
            load_timeout_ms: 5_000,
            max_operations: ScriptLimits::default().max_operations,
            max_call_levels: ScriptLimits::default().max_call_levels,
        }
    }
}

impl AddonConfig {
    /// Load with the full precedence chain from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the home directory cannot be found, a
    /// layer is malformed, or the result fails validation.
    pub fn load() -> ConfigResult<Self> {
        let env = collect_env_vars();
        let home = match env.get("QUILL_HOME") {
            Some(home) if !home.trim().is_empty() => PathBuf::from(home),
            _ => home_directory()?,
        };
        Self::load_from(&home, &env)
    }

    /// Load with an explicit home directory and environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a layer is malformed or the result fails
    /// validation.
    pub fn load_from(home: &Path, env: &BTreeMap<String, String>) -> ConfigResult<Self> {
        let mut merged: toml::Value =
            toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
                path: "<embedded defaults>".to_owned(),
                source: e,
            })?;

        let user_path = home.join(USER_CONFIG_FILE);
        if let Some(user) = try_load_file(&user_path)? {
            debug!(path = %user_path.display(), "Merging user addon config");
            deep_merge(&mut merged, user);
        }

        let applied = apply_env_overrides(&mut merged, env)?;
        if applied > 0 {
            debug!(count = applied, "Applied addon config environment overrides");
        }

        let mut config: Self = merged.try_into().map_err(|e| ConfigError::ParseError {
            path: user_path.display().to_string(),
            source: e,
        })?;
        config.resolve_paths(home);
        config.validate()?;
        Ok(config)
    }

    /// Make relative paths absolute against `home`.
    pub fn resolve_paths(&mut self, home: &Path) {
        for path in [
            &mut self.plugins_dir,
            &mut self.themes_dir,
            &mut self.state_file,
        ] {
            if path.is_relative() {
                *path = home.join(&*path);
            }
        }
    }

    /// Check ranges and cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(ConfigError::ValidationError {
                field: "debounce_ms".into(),
                message: format!("must be at most {MAX_DEBOUNCE_MS}, got {}", self.debounce_ms),
            });
        }
        if self.max_call_levels == 0 {
            return Err(ConfigError::ValidationError {
                field: "max_call_levels".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.plugins_dir == self.themes_dir {
            return Err(ConfigError::ValidationError {
                field: "themes_dir".into(),
                message: format!(
                    "must differ from plugins_dir ({})",
                    self.plugins_dir.display()
                ),
            });
        }
        if self.state_file.starts_with(&self.plugins_dir)
            || self.state_file.starts_with(&self.themes_dir)
        {
            return Err(ConfigError::ValidationError {
                field: "state_file".into(),
                message: "must not live inside a watched addon directory".into(),
            });
        }
        Ok(())
    }

    /// Debounce window for file events.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Bound on source reads. Zero means unbounded.
    #[must_use]
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    /// Execution limits for plugin engines.
    #[must_use]
    pub fn script_limits(&self) -> ScriptLimits {
        ScriptLimits {
            max_operations: self.max_operations,
            max_call_levels: self.max_call_levels,
        }
    }
}

fn collect_env_vars() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k == "QUILL_HOME" || k.starts_with(ENV_PREFIX))
        .collect()
}

fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".quill"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Read and parse a TOML file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit",
                content.len()
            ),
        });
    }

    toml::from_str(&content)
        .map(Some)
        .map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })
}

/// Merge `overlay` into `base`, recursing into tables.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    },
                }
            }
        },
        (base, overlay) => *base = overlay,
    }
}

/// Apply `QUILL_ADDONS_<KEY>` overrides for keys the defaults declare,
/// parsing each value as the type of its default.
fn apply_env_overrides(
    merged: &mut toml::Value,
    env: &BTreeMap<String, String>,
) -> ConfigResult<usize> {
    let Some(table) = merged.as_table_mut() else {
        return Ok(0);
    };
    let mut applied = 0_usize;
    for (key, current) in table.iter_mut() {
        let var = format!("{ENV_PREFIX}{}", key.to_uppercase());
        let Some(raw) = env.get(&var) else {
            continue;
        };
        let raw = raw.trim();
        let invalid = |message: String| ConfigError::InvalidEnv {
            var: var.clone(),
            message,
        };
        let parsed = match &*current {
            toml::Value::Boolean(_) => toml::Value::Boolean(match raw {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => return Err(invalid(format!("expected a boolean, got '{other}'"))),
            }),
            toml::Value::Integer(_) => toml::Value::Integer(
                raw.parse()
                    .map_err(|e| invalid(format!("expected an integer: {e}")))?,
            ),
            _ => toml::Value::String(raw.to_string()),
        };
        *current = parsed;
        applied = applied.saturating_add(1);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_parse() {
        let value: toml::Value = toml::from_str(DEFAULTS_TOML).unwrap();
        let config: AddonConfig = value.try_into().unwrap();
        assert_eq!(config, AddonConfig::default());
    }

    #[test]
    fn test_load_without_user_file_resolves_paths() {
        let home = tempfile::tempdir().unwrap();
        let config = AddonConfig::load_from(home.path(), &BTreeMap::new()).unwrap();
        assert_eq!(config.plugins_dir, home.path().join("plugins"));
        assert_eq!(config.themes_dir, home.path().join("themes"));
        assert_eq!(config.state_file, home.path().join("addons.json"));
        assert!(config.watch);
    }

    #[test]
    fn test_user_file_overrides_defaults() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join(USER_CONFIG_FILE),
            "watch = false\ndebounce_ms = 50\nplugins_dir = \"/opt/quill/plugins\"\n",
        )
        .unwrap();
        let config = AddonConfig::load_from(home.path(), &BTreeMap::new()).unwrap();
        assert!(!config.watch);
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.plugins_dir, PathBuf::from("/opt/quill/plugins"));
    }

    #[test]
    fn test_env_overrides_user_file() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join(USER_CONFIG_FILE), "max_operations = 10\n").unwrap();
        let config = AddonConfig::load_from(
            home.path(),
            &env(&[
                ("QUILL_ADDONS_MAX_OPERATIONS", "99"),
                ("QUILL_ADDONS_WATCH", "off"),
            ]),
        )
        .unwrap();
        assert_eq!(config.max_operations, 99);
        assert!(!config.watch);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let err = AddonConfig::load_from(home.path(), &env(&[("QUILL_ADDONS_WATCH", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_malformed_user_file_is_a_parse_error() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join(USER_CONFIG_FILE), "watch = [").unwrap();
        let err = AddonConfig::load_from(home.path(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_validation_rejects_shared_dirs() {
        let mut config = AddonConfig::default();
        config.themes_dir = config.plugins_dir.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_state_inside_addon_dir() {
        let mut config = AddonConfig::default();
        config.resolve_paths(Path::new("/home/u/.quill"));
        config.state_file = config.plugins_dir.join("state.json");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_long_debounce() {
        let config = AddonConfig {
            debounce_ms: 60_001,
            ..AddonConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
