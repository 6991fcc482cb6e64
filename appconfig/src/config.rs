use crate::types::{NULL_LABEL, SettingSelector};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("no connection method configured for store")]
    MissingConnection,

    #[error("more than one connection method configured for store {0}")]
    MultipleConnections(String),

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("connection string is missing {0}")]
    InvalidConnectionString(&'static str),

    #[error("store {0} has monitoring enabled but no triggers")]
    MissingTriggers(String),

    #[error("duplicate store origin: {0}")]
    DuplicateStore(String),

    #[error("min backoff ({min}s) must not exceed max backoff ({max}s)")]
    InvalidBackoff { min: u64, max: u64 },
}

/// Provider wide settings and the list of configured stores.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub stores: Vec<StoreConfig>,
    /// Forced refresh interval. When set, every store is checked at least this
    /// often regardless of its own refresh interval.
    #[serde(default)]
    pub refresh_interval_secs: Option<u64>,
    #[serde(default = "default_min_backoff_secs")]
    pub min_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min_backoff_secs > self.max_backoff_secs {
            return Err(ValidationError::InvalidBackoff {
                min: self.min_backoff_secs,
                max: self.max_backoff_secs,
            });
        }

        let mut origins = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            store.validate()?;
            let origin = store.origin()?;
            if origins.contains(&origin) {
                return Err(ValidationError::DuplicateStore(origin));
            }
            origins.push(origin);
        }

        Ok(())
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.min_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_secs.map(Duration::from_secs)
    }
}

fn default_min_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    600
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// A logical configuration store, possibly replicated across several endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StoreConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Origin first, replicas after it in failover order.
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub connection_string: Option<String>,
    #[serde(default)]
    pub connection_strings: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default = "default_selects")]
    pub selects: Vec<SettingSelector>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagStoreConfig,
}

impl StoreConfig {
    /// A store reached through the given endpoints with every other setting defaulted.
    pub fn with_endpoints<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StoreConfig {
            endpoint: None,
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            connection_string: None,
            connection_strings: Vec::new(),
            enabled: true,
            fail_fast: true,
            selects: default_selects(),
            monitoring: MonitoringConfig::default(),
            feature_flags: FeatureFlagStoreConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let methods = [
            self.endpoint.is_some(),
            !self.endpoints.is_empty(),
            self.connection_string.is_some(),
            !self.connection_strings.is_empty(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();

        match methods {
            0 => return Err(ValidationError::MissingConnection),
            1 => {}
            _ => {
                let name = self
                    .endpoint
                    .clone()
                    .or_else(|| self.endpoints.first().cloned())
                    .unwrap_or_else(|| "<connection string>".into());
                return Err(ValidationError::MultipleConnections(name));
            }
        }

        for endpoint in self.endpoint_list()? {
            Url::parse(&endpoint).map_err(|e| ValidationError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        }

        if self.monitoring.enabled && self.monitoring.triggers.is_empty() {
            return Err(ValidationError::MissingTriggers(self.origin()?));
        }

        Ok(())
    }

    /// Every endpoint of the store, origin first, without trailing slashes.
    pub fn endpoint_list(&self) -> Result<Vec<String>, ValidationError> {
        let endpoints = if let Some(endpoint) = &self.endpoint {
            vec![endpoint.clone()]
        } else if !self.endpoints.is_empty() {
            self.endpoints.clone()
        } else if let Some(connection_string) = &self.connection_string {
            vec![ConnectionString::parse(connection_string)?.endpoint]
        } else {
            self.connection_strings
                .iter()
                .map(|c| ConnectionString::parse(c).map(|c| c.endpoint))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(endpoints
            .into_iter()
            .map(|e| e.trim_end_matches('/').to_string())
            .collect())
    }

    /// The identifier of the store: its first endpoint.
    pub fn origin(&self) -> Result<String, ValidationError> {
        self.endpoint_list()?
            .into_iter()
            .next()
            .ok_or(ValidationError::MissingConnection)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub enabled: bool,
    /// A negative interval makes the store due on every cycle and cannot be expired.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: i64,
    #[serde(default = "default_refresh_interval_secs")]
    pub feature_flag_refresh_interval_secs: i64,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enabled: false,
            refresh_interval_secs: default_refresh_interval_secs(),
            feature_flag_refresh_interval_secs: default_refresh_interval_secs(),
            triggers: Vec::new(),
        }
    }
}

fn default_refresh_interval_secs() -> i64 {
    30
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TriggerConfig {
    pub key: String,
    #[serde(default = "default_label")]
    pub label: String,
}

impl TriggerConfig {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        TriggerConfig {
            key: key.into(),
            label: label.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FeatureFlagStoreConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Key filters are relative to the feature flag prefix.
    #[serde(default = "default_feature_flag_selects")]
    pub selects: Vec<SettingSelector>,
}

impl Default for FeatureFlagStoreConfig {
    fn default() -> Self {
        FeatureFlagStoreConfig {
            enabled: false,
            selects: default_feature_flag_selects(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_label() -> String {
    NULL_LABEL.to_string()
}

fn default_selects() -> Vec<SettingSelector> {
    vec![SettingSelector::new("/application/*", NULL_LABEL)]
}

fn default_feature_flag_selects() -> Vec<SettingSelector> {
    vec![SettingSelector::new("*", NULL_LABEL)]
}

/// `Endpoint=...;Id=...;Secret=...`. Only the endpoint is used; the credential
/// parts are checked for presence.
#[derive(Debug, PartialEq)]
pub struct ConnectionString {
    pub endpoint: String,
    pub id: String,
}

impl ConnectionString {
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        let mut endpoint = None;
        let mut id = None;
        let mut secret = None;

        for part in s.split(';').filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some(("Endpoint", v)) => endpoint = Some(v.to_string()),
                Some(("Id", v)) => id = Some(v.to_string()),
                // Secrets may contain '='
                Some(("Secret", v)) => secret = Some(v.to_string()),
                _ => {}
            }
        }

        let endpoint = endpoint
            .filter(|e| !e.is_empty())
            .ok_or(ValidationError::InvalidConnectionString("Endpoint"))?;
        let id = id
            .filter(|i| !i.is_empty())
            .ok_or(ValidationError::InvalidConnectionString("Id"))?;
        secret
            .filter(|s| !s.is_empty())
            .ok_or(ValidationError::InvalidConnectionString("Secret"))?;

        Ok(ConnectionString { endpoint, id })
    }
}
