//! TOML configuration for the harvester core and CLI.
//!
//! Every field is optional; a missing config file means defaults everywhere.
//! Values are range-checked by [`HarvesterConfig::validate`] so a typo in the
//! file fails loudly instead of producing a runaway retry loop.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::processor::PaginationPolicy;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// The config file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// The config file.
        path: PathBuf,
        /// The TOML decoder error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{key}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Dotted key of the offending value.
        key: String,
        /// The value found.
        value: u64,
        /// Human-readable accepted range.
        expected: &'static str,
    },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvesterConfig {
    /// Directory holding persisted indexes.
    pub index_dir: Option<PathBuf>,
    /// Default destination for written images.
    pub output_dir: Option<PathBuf>,
    /// Pagination/retry tuning shared by all processors.
    pub retrieval: RetrievalSettings,
    /// Per-processor endpoint and credential overrides, keyed by processor id.
    pub processors: BTreeMap<String, ProcessorSettings>,
    /// External plugin bundles to register at startup.
    pub plugins: Vec<PluginEntry>,
}

/// Pagination and HTTP tuning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrievalSettings {
    /// Consecutive failed pages before a retrieval is abandoned.
    pub max_consecutive_failures: u32,
    /// Attempts per page before the page counts as failed.
    pub page_attempts: u32,
    /// Pause between attempts at the same page, in milliseconds.
    pub attempt_delay_ms: u64,
    /// Cool-down after a rate-limit response, in seconds.
    pub rate_limit_cooldown_secs: u64,
    /// Pause between successful pages, in milliseconds.
    pub page_delay_ms: u64,
    /// HTTP connect timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout, in seconds.
    pub read_timeout_secs: u64,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            page_attempts: 4,
            attempt_delay_ms: 1_000,
            rate_limit_cooldown_secs: 8,
            page_delay_ms: 750,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
        }
    }
}

impl RetrievalSettings {
    /// Builds the pagination policy these settings describe.
    ///
    /// Cursor layout fields keep their defaults; each processor adjusts them.
    #[must_use]
    pub fn pagination_policy(&self) -> PaginationPolicy {
        PaginationPolicy {
            max_consecutive_failures: self.max_consecutive_failures,
            page_attempts: self.page_attempts,
            attempt_delay: Duration::from_millis(self.attempt_delay_ms),
            rate_limit_cooldown: Duration::from_secs(self.rate_limit_cooldown_secs),
            page_delay: Duration::from_millis(self.page_delay_ms),
            ..PaginationPolicy::default()
        }
    }

    /// Returns the HTTP connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Returns the HTTP read timeout.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Endpoint and credential overrides for one processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorSettings {
    /// Listing endpoint base URL.
    pub base_url: Option<String>,
    /// Token endpoint for processors that log in.
    pub auth_url: Option<String>,
    /// Account name.
    pub login: Option<String>,
    /// API key, for processors that authenticate with one.
    pub api_key: Option<String>,
    /// Password, for processors that exchange it for a token.
    pub password: Option<String>,
    /// Items requested per page.
    pub page_size: Option<u32>,
}

/// One external plugin bundle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginEntry {
    /// Path to the bundle manifest.
    pub manifest: PathBuf,
}

impl HarvesterConfig {
    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or a validation error.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or a validation error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&raw, path)?;
        if let Some(base) = path.parent() {
            for plugin in &mut config.plugins {
                if plugin.manifest.is_relative() {
                    plugin.manifest = base.join(&plugin.manifest);
                }
            }
        }
        Ok(config)
    }

    /// Loads the default config file if it exists, otherwise returns defaults.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`HarvesterConfig::load`] for an existing file.
    pub fn load_default() -> Result<Self, ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Checks every numeric value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.retrieval;
        check_range(
            "retrieval.max_consecutive_failures",
            u64::from(r.max_consecutive_failures),
            1..=100,
            "1..=100",
        )?;
        check_range(
            "retrieval.page_attempts",
            u64::from(r.page_attempts),
            1..=10,
            "1..=10",
        )?;
        check_range(
            "retrieval.attempt_delay_ms",
            r.attempt_delay_ms,
            0..=60_000,
            "0..=60000",
        )?;
        check_range(
            "retrieval.rate_limit_cooldown_secs",
            r.rate_limit_cooldown_secs,
            0..=600,
            "0..=600",
        )?;
        check_range(
            "retrieval.page_delay_ms",
            r.page_delay_ms,
            0..=60_000,
            "0..=60000",
        )?;
        check_range(
            "retrieval.connect_timeout_secs",
            r.connect_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        check_range(
            "retrieval.read_timeout_secs",
            r.read_timeout_secs,
            1..=3600,
            "1..=3600",
        )?;
        for (id, settings) in &self.processors {
            if let Some(page_size) = settings.page_size {
                check_range(
                    &format!("processors.{id}.page_size"),
                    u64::from(page_size),
                    1..=1000,
                    "1..=1000",
                )?;
            }
        }
        Ok(())
    }

    /// Returns overrides for one processor (defaults when absent).
    #[must_use]
    pub fn processor(&self, id: &str) -> ProcessorSettings {
        self.processors.get(id).cloned().unwrap_or_default()
    }

    /// Returns the configured index directory or the platform default.
    #[must_use]
    pub fn index_dir(&self) -> PathBuf {
        self.index_dir
            .clone()
            .unwrap_or_else(resolve_default_index_dir)
    }
}

fn check_range(
    key: &str,
    value: u64,
    range: std::ops::RangeInclusive<u64>,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value,
            expected,
        })
    }
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/harvester/config.toml`
/// 2. `$HOME/.config/harvester/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("harvester")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("harvester")
            .join("config.toml"),
    )
}

/// Resolves the default index directory.
///
/// Priority:
/// 1. `$XDG_DATA_HOME/harvester/indexes`
/// 2. `$HOME/.local/share/harvester/indexes`
/// 3. `./.harvester/indexes`
#[must_use]
pub fn resolve_default_index_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home)
            .join("harvester")
            .join("indexes");
    }
    if let Some(home) = env_var_non_empty_os("HOME") {
        return PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("harvester")
            .join("indexes");
    }
    PathBuf::from(".harvester").join("indexes")
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<HarvesterConfig, ConfigError> {
        HarvesterConfig::from_toml_str(raw, Path::new("config.toml"))
    }

    #[test]
    fn test_config_empty_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.retrieval, RetrievalSettings::default());
        assert!(config.processors.is_empty());
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_config_parses_all_sections() {
        let config = parse(
            r#"
index_dir = "/var/lib/harvester"
output_dir = "./images"

[retrieval]
max_consecutive_failures = 5
page_attempts = 2
rate_limit_cooldown_secs = 3

[processors.danbooru]
base_url = "http://localhost:9000"
login = "me"
api_key = "secret"
page_size = 50

[[plugins]]
manifest = "plugins/site.toml"
"#,
        )
        .unwrap();

        assert_eq!(config.index_dir(), PathBuf::from("/var/lib/harvester"));
        assert_eq!(config.retrieval.max_consecutive_failures, 5);
        assert_eq!(config.retrieval.page_attempts, 2);
        assert_eq!(config.retrieval.page_delay_ms, 750);
        let danbooru = config.processor("danbooru");
        assert_eq!(danbooru.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(danbooru.page_size, Some(50));
        assert_eq!(config.processor("gelbooru"), ProcessorSettings::default());
        assert_eq!(config.plugins.len(), 1);
    }

    #[test]
    fn test_config_pagination_policy_reflects_settings() {
        let config = parse("[retrieval]\nrate_limit_cooldown_secs = 2\npage_delay_ms = 0").unwrap();
        let policy = config.retrieval.pagination_policy();
        assert_eq!(policy.max_consecutive_failures, 10);
        assert_eq!(policy.rate_limit_cooldown, Duration::from_secs(2));
        assert_eq!(policy.page_delay, Duration::ZERO);
    }

    #[test]
    fn test_config_rejects_out_of_range() {
        let err = parse("[retrieval]\nmax_consecutive_failures = 0").unwrap_err();
        assert!(err.to_string().contains("max_consecutive_failures"));

        let err = parse("[processors.x]\npage_size = 5000").unwrap_err();
        assert!(err.to_string().contains("processors.x.page_size"));
    }

    #[test]
    fn test_config_rejects_unknown_keys() {
        let err = parse("concurrency = 4").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_config_load_resolves_plugin_paths_against_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[plugins]]\nmanifest = \"plugins/site.toml\"\n").unwrap();

        let config = HarvesterConfig::load(&path).unwrap();
        assert_eq!(
            config.plugins[0].manifest,
            dir.path().join("plugins/site.toml")
        );
    }
}
