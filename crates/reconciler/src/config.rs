//! Controller configuration.

use std::path::Path;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::queue::BackoffPolicy;

/// Environment variable overriding [`ControllerConfig::target_namespace`].
pub const NAMESPACE_ENV: &str = "REVISION_CONTROLLER_NAMESPACE";

/// Configuration for the revision controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace holding the sources and their revision copies.
    pub target_namespace: String,

    /// Config maps copied into every revision. The first one conventionally
    /// carries the workload manifest.
    #[serde(default)]
    pub config_maps: Vec<String>,

    /// Secrets copied into every revision.
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Requested worker count. Only one worker is ever started.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Requeue backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

const fn default_workers() -> usize {
    1
}

/// Backoff settings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Cap for a single delay. Zero disables the cap.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_delay_ms() -> u64 {
    1_000_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl BackoffConfig {
    /// The policy handed to the work queue.
    #[must_use]
    pub fn policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(Duration::from_millis(self.base_delay_ms), self.multiplier);
        match self.max_delay_ms {
            0 => policy,
            max => policy.with_max_delay(Duration::from_millis(max)),
        }
    }
}

impl ControllerConfig {
    /// Create a config for `target_namespace` with no sources.
    pub fn new(target_namespace: impl Into<String>) -> Self {
        Self {
            target_namespace: target_namespace.into(),
            config_maps: Vec::new(),
            secrets: Vec::new(),
            workers: default_workers(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Add config maps to copy.
    #[must_use]
    pub fn with_config_maps<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config_maps.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add secrets to copy.
    #[must_use]
    pub fn with_secrets<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets.extend(names.into_iter().map(Into::into));
        self
    }

    /// Set the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigParse`] for malformed TOML and
    /// [`Error::InvalidConfig`] when validation fails.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::config_parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, apply environment overrides and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigRead`] when the file cannot be read, otherwise
    /// the errors of [`ControllerConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config_read(path, e.to_string()))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::config_parse(format!("{}: {e}", path.display())))?;
        let config = config.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`.
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(namespace) = lookup(NAMESPACE_ENV).filter(|ns| !ns.is_empty()) {
            self.target_namespace = namespace;
        }
        self
    }

    /// Check the config is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.target_namespace.trim().is_empty() {
            return Err(Error::invalid_config("target_namespace must not be empty"));
        }
        if self.config_maps.is_empty() {
            return Err(Error::invalid_config(
                "at least one config map must be configured",
            ));
        }
        if let Some(name) = self
            .config_maps
            .iter()
            .chain(&self.secrets)
            .find(|name| name.trim().is_empty())
        {
            return Err(Error::invalid_config(format!(
                "resource names must not be empty (got {name:?})"
            )));
        }
        if let Some(name) = self.config_maps.iter().duplicates().next() {
            return Err(Error::invalid_config(format!(
                "config map '{name}' is listed more than once"
            )));
        }
        if let Some(name) = self.secrets.iter().duplicates().next() {
            return Err(Error::invalid_config(format!(
                "secret '{name}' is listed more than once"
            )));
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        self.validate_backoff()
    }

    fn validate_backoff(&self) -> Result<()> {
        let backoff = &self.backoff;
        if backoff.base_delay_ms == 0 {
            return Err(Error::invalid_config("backoff.base_delay_ms must be positive"));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(Error::invalid_config(
                "backoff.multiplier must be a finite number >= 1",
            ));
        }
        if backoff.max_delay_ms != 0 && backoff.max_delay_ms < backoff.base_delay_ms {
            return Err(Error::invalid_config(
                "backoff.max_delay_ms must not be below backoff.base_delay_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
target_namespace = "openshift-kube-apiserver"
config_maps = ["pod", "config"]
secrets = ["serving-cert"]

[backoff]
base_delay_ms = 10
multiplier = 3.0
"#;

    #[test]
    fn test_parse_sample() {
        let config = ControllerConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.target_namespace, "openshift-kube-apiserver");
        assert_eq!(config.config_maps, vec!["pod", "config"]);
        assert_eq!(config.secrets, vec!["serving-cert"]);
        assert_eq!(config.workers, 1);
        assert_eq!(config.backoff.base_delay_ms, 10);
        assert_eq!(config.backoff.max_delay_ms, 1_000_000);
    }

    #[test]
    fn test_backoff_defaults_match_policy_defaults() {
        assert_eq!(BackoffConfig::default().policy(), BackoffPolicy::default());
    }

    #[test]
    fn test_zero_cap_disables_cap() {
        let backoff = BackoffConfig {
            max_delay_ms: 0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff.policy().max_delay, None);
    }

    #[test]
    fn test_rejects_missing_config_maps() {
        let err = ControllerConfig::from_toml_str("target_namespace = \"ns\"").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_rejects_duplicates() {
        let config = ControllerConfig::new("ns").with_config_maps(["pod", "pod"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'pod'"));
    }

    #[test]
    fn test_rejects_shrinking_multiplier() {
        let config = ControllerConfig::new("ns")
            .with_config_maps(["pod"])
            .with_backoff(BackoffConfig {
                multiplier: 0.5,
                ..BackoffConfig::default()
            });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = ControllerConfig::from_toml_str("config_maps = [").unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_env_override_replaces_namespace() {
        let config = ControllerConfig::new("ns")
            .with_config_maps(["pod"])
            .with_env_overrides(|key| (key == NAMESPACE_ENV).then(|| "other".to_string()));
        assert_eq!(config.target_namespace, "other");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.config_maps.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ControllerConfig::load(Path::new("/nonexistent/controller.toml")).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
