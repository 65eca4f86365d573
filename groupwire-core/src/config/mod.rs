//! Configuration management for groupwire
//!
//! Configuration comes from defaults, an optional TOML file and
//! `GROUPWIRE_*` environment variables, in that order of precedence
//! (environment wins).

use crate::core_relay::backoff::ReconnectPolicy;
use crate::core_relay::types::RelayUrl;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Relays contacted when nothing else is configured
pub const DEFAULT_RELAYS: &[&str] = &["wss://relay.damus.io", "wss://nos.lol"];

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay connections
    pub relays: RelayConfig,

    /// Session behaviour
    pub session: SessionConfig,

    /// Snapshot storage
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Relay connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay URLs connected at login
    pub urls: Vec<String>,

    /// Upper bound for a single connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Retry failed or dropped relays in the background
    pub auto_reconnect: bool,

    /// Publish attempts before giving up when every relay rejects
    pub publish_attempts: u32,

    /// Backoff schedule for reconnects and publish retries
    pub reconnect: ReconnectPolicy,
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Join groups as soon as a welcome arrives instead of queueing an invite
    pub auto_accept_welcomes: bool,

    /// Processed message ids remembered for deduplication
    pub processed_id_capacity: usize,

    /// Buffer size of the session event broadcast
    pub event_capacity: usize,

    /// Future-epoch commits held per group until their predecessors arrive
    pub deferred_commit_limit: usize,

    /// Key packages fetched per invite attempt
    pub key_package_fetch_limit: usize,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding snapshot files
    pub data_dir: PathBuf,

    /// Encrypt snapshots at rest (requires a passphrase)
    pub encrypt: bool,

    /// Only read from `GROUPWIRE_STORAGE_PASSPHRASE`, never written out
    #[serde(skip)]
    pub passphrase: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include timestamps
    pub with_timestamp: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            urls: DEFAULT_RELAYS.iter().map(|url| url.to_string()).collect(),
            connect_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            publish_attempts: 3,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_accept_welcomes: false,
            processed_id_capacity: 10_000,
            event_capacity: 256,
            deferred_commit_limit: 64,
            key_package_fetch_limit: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./groupwire-data"),
            encrypt: false,
            passphrase: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl RelayConfig {
    /// Configured URLs in normalized form
    pub fn relay_urls(&self) -> ConfigResult<Vec<RelayUrl>> {
        self.urls
            .iter()
            .map(|url| {
                RelayUrl::parse(url)
                    .map_err(|e| ConfigError::InvalidRelayUrl {
                    url: url.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: GROUPWIRE_<SECTION>_<KEY>
    /// Example: GROUPWIRE_RELAY_CONNECT_TIMEOUT_SECS=5
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// File (when given) then environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GROUPWIRE_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Relay config
        if let Some(urls) = lookup("GROUPWIRE_RELAYS") {
            self.relays.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = lookup("GROUPWIRE_RELAY_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| invalid_override("GROUPWIRE_RELAY_CONNECT_TIMEOUT_SECS", e))?;
            self.relays.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(flag) = lookup("GROUPWIRE_RELAY_AUTO_RECONNECT") {
            self.relays.auto_reconnect = flag
                .parse()
                .map_err(|e| invalid_override("GROUPWIRE_RELAY_AUTO_RECONNECT", e))?;
        }
        if let Some(attempts) = lookup("GROUPWIRE_RELAY_PUBLISH_ATTEMPTS") {
            self.relays.publish_attempts = attempts
                .parse()
                .map_err(|e| invalid_override("GROUPWIRE_RELAY_PUBLISH_ATTEMPTS", e))?;
        }

        // Session config
        if let Some(flag) = lookup("GROUPWIRE_SESSION_AUTO_ACCEPT") {
            self.session.auto_accept_welcomes = flag
                .parse()
                .map_err(|e| invalid_override("GROUPWIRE_SESSION_AUTO_ACCEPT", e))?;
        }

        // Storage config
        if let Some(dir) = lookup("GROUPWIRE_STORAGE_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(passphrase) = lookup("GROUPWIRE_STORAGE_PASSPHRASE") {
            self.storage.passphrase = Some(passphrase);
            self.storage.encrypt = true;
        }

        // Logging config
        if let Some(level) = lookup("GROUPWIRE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("GROUPWIRE_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| invalid_override("GROUPWIRE_LOG_JSON", e))?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        // Validate relay config
        self.relays.relay_urls()?;
        if self.relays.connect_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        if self.relays.publish_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "publish_attempts must be greater than 0".to_string(),
            ));
        }
        self.relays
            .reconnect
            .validate()
            .map_err(ConfigError::ValidationFailed)?;

        // Validate session config
        if self.session.processed_id_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "processed_id_capacity must be greater than 0".to_string(),
            ));
        }
        if self.session.event_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        if self.session.key_package_fetch_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "key_package_fetch_limit must be greater than 0".to_string(),
            ));
        }

        // Validate storage config
        if self.storage.encrypt && self.storage.passphrase.is_none() {
            return Err(ConfigError::ValidationFailed(
                "storage encryption enabled but no passphrase provided".to_string(),
            ));
        }

        // Validate logging config
        if LogLevel::from_str(&self.logging.level).is_none() {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(())
    }
}

fn invalid_override(key: &'static str, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidOverride {
        key,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relays.urls, vec!["wss://relay.damus.io", "wss://nos.lol"]);
        assert_eq!(config.relays.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.relays.publish_attempts, 3);
        assert!(!config.session.auto_accept_welcomes);
        assert_eq!(config.session.processed_id_capacity, 10_000);
        assert_eq!(config.session.event_capacity, 256);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.relays.urls.push("http://not-a-relay".to_string());
        assert!(config.validate().is_err());

        config = Config::default();
        config.relays.publish_attempts = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.storage.encrypt = true;
        assert!(config.validate().is_err());

        config.storage.passphrase = Some("hunter2".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("GROUPWIRE_RELAYS", " wss://a.example , wss://b.example/,"),
                ("GROUPWIRE_RELAY_CONNECT_TIMEOUT_SECS", "3"),
                ("GROUPWIRE_SESSION_AUTO_ACCEPT", "true"),
                ("GROUPWIRE_STORAGE_PASSPHRASE", "secret"),
                ("GROUPWIRE_LOG_LEVEL", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.relays.urls, vec!["wss://a.example", "wss://b.example/"]);
        assert_eq!(config.relays.connect_timeout, Duration::from_secs(3));
        assert!(config.session.auto_accept_welcomes);
        assert!(config.storage.encrypt);
        assert_eq!(config.logging.level, "debug");
        assert!(config.validate().is_ok());

        let urls = config.relays.relay_urls().unwrap();
        assert_eq!(urls[1].as_str(), "wss://b.example");
    }

    #[test]
    fn test_env_override_rejects_bad_numbers() {
        let mut config = Config::default();
        let result = config.apply_overrides(lookup_from(&[(
            "GROUPWIRE_RELAY_PUBLISH_ATTEMPTS",
            "many",
        )]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidOverride {
                key: "GROUPWIRE_RELAY_PUBLISH_ATTEMPTS",
                ..
            })
        ));
    }

    #[test]
    fn test_file_roundtrip_keeps_passphrase_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groupwire.toml");

        let mut config = Config::default();
        config.relays.urls = vec!["wss://relay.example".to_string()];
        config.storage.encrypt = true;
        config.storage.passphrase = Some("secret".to_string());
        config.save_to_file(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("secret"));
        assert!(written.contains("connect_timeout = \"10s\""));

        // Encryption without a passphrase fails validation on load
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[session]\nauto_accept_welcomes = true\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert!(config.session.auto_accept_welcomes);
        assert_eq!(config.relays, RelayConfig::default());
    }
}
