use appconfig::ProviderConfig;
use appconfig::config::ValidationError;
use serde::Deserialize;
use std::fs::File;
use std::time::Duration;

#[derive(Deserialize, Debug)]
pub struct MetricsConfig {
    pub statsd_host: String,
    #[serde(default = "default_statsd_port")]
    pub statsd_port: u16,
}

fn default_statsd_port() -> u16 {
    8125
}

#[derive(Deserialize, Debug)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Deserialize, Debug)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3001,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// How often the refresh engine is asked to check the stores.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub admin_listener: Listener,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    pub provider: ProviderConfig,
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.admin_listener.port == 0 {
            return Err(ConfigError::InvalidAdminPort);
        }
        self.provider.validate()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid provider config: {0}")]
    ValidationError(#[from] ValidationError),
    #[error("poll_interval_secs must be greater than zero")]
    InvalidPollInterval,
    #[error("admin listener port must not be zero")]
    InvalidAdminPort,
}
