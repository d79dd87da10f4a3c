//! Configuration types for the conversation engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::ChainConfig;
use crate::client::ClientIdentity;
use crate::error::{EngineError, Result};
use crate::timeline::DEFAULT_EVENT_BUFFER;
use crate::tokens::{CharRatioEstimator, TokenEstimator};

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chain runner retry policy
    pub chain: ChainConfig,

    /// Session storage
    pub store: StoreConfig,

    /// Token estimation
    pub estimator: EstimatorConfig,

    /// Model used when a session has none of its own, as "provider/model"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_client: Option<String>,

    /// Capacity of each timeline's notification channel
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            store: StoreConfig::default(),
            estimator: EstimatorConfig::default(),
            default_client: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Session storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding one JSON file per session
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("colloquy")
                .join("sessions"),
        }
    }
}

/// Token estimator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Characters counted as one token
    pub chars_per_token: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl EngineConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `colloquy.toml` in the working directory
    /// 3. The file named by `COLLOQUY_CONFIG_PATH`
    /// 4. `COLLOQUY_` environment variables, nested with `__`
    ///    (e.g. `COLLOQUY_CHAIN__MAX_ATTEMPTS=5`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the
    /// merged result fails validation.
    pub fn load() -> Result<Self> {
        use figment::providers::{Env, Format, Toml};

        let mut figment = Self::figment().merge(Toml::file("colloquy.toml"));
        if let Ok(path) = std::env::var("COLLOQUY_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(
            Env::prefixed("COLLOQUY_")
                .ignore(&["CONFIG_PATH"])
                .split("__"),
        );

        Self::from_figment(figment)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or fails validation.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::providers::{Format, Toml};

        Self::from_figment(Self::figment().merge(Toml::file(path.as_ref())))
    }

    /// Figment seeded with the defaults
    pub fn figment() -> figment::Figment {
        figment::Figment::from(figment::providers::Serialized::defaults(Self::default()))
    }

    /// Extract and validate from an assembled figment
    pub fn from_figment(figment: figment::Figment) -> Result<Self> {
        let config: EngineConfig = figment.extract().map_err(|e| {
            EngineError::Configuration(format!("Failed to load configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Builder: override the store directory
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store.dir = dir.into();
        self
    }

    /// The configured default client, parsed
    pub fn default_client_identity(&self) -> Result<Option<ClientIdentity>> {
        self.default_client.as_deref().map(str::parse).transpose()
    }

    /// The estimator described by this configuration
    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::new(CharRatioEstimator::new(self.estimator.chars_per_token))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.chain.max_attempts == 0 {
            return Err(EngineError::Configuration(
                "chain.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.chain.backoff_multiplier < 1.0 {
            return Err(EngineError::Configuration(
                "chain.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.estimator.chars_per_token == 0 {
            return Err(EngineError::Configuration(
                "estimator.chars_per_token must be at least 1".to_string(),
            ));
        }
        self.default_client_identity()?;
        if self.event_buffer == 0 {
            return Err(EngineError::Configuration(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chain.max_attempts, 3);
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert!(config.store.dir.ends_with("colloquy/sessions"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let figment = EngineConfig::figment().merge(Toml::string(
            r#"
            default_client = "local/echo"

            [chain]
            max_attempts = 5
            initial_delay = "250ms"
            "#,
        ));
        let config = EngineConfig::from_figment(figment).unwrap();

        assert_eq!(config.chain.max_attempts, 5);
        assert_eq!(config.chain.initial_delay, Duration::from_millis(250));
        assert_eq!(config.chain.backoff_multiplier, 2.0);
        assert_eq!(config.estimator.chars_per_token, 4);
        assert_eq!(
            config.default_client_identity().unwrap(),
            Some(ClientIdentity::new("local", "echo"))
        );
    }

    #[test]
    fn test_malformed_default_client_rejected() {
        let figment = EngineConfig::figment().merge(Toml::string("default_client = \"echo\"\n"));
        assert!(matches!(
            EngineConfig::from_figment(figment),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let figment = EngineConfig::figment().merge(Toml::string("[chain]\nmax_attempts = 0\n"));
        let err = EngineConfig::from_figment(figment).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let mut config = EngineConfig::default();
        config.estimator.chars_per_token = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("colloquy.toml");
        std::fs::write(&path, "event_buffer = 16\n[store]\ndir = \"/tmp/sessions\"\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.event_buffer, 16);
        assert_eq!(config.store.dir, PathBuf::from("/tmp/sessions"));
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "event_buffer = \"many\"\n").unwrap();

        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(EngineError::Configuration(_))
        ));
    }
}
