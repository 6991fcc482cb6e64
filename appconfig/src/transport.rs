//! The network collaborator behind each replica client.
//!
//! A transport fetches one setting or lists settings for a selector and reports
//! failures with the upstream status code when there is one. Classifying those
//! failures as retryable or not is left to [`crate::replica_client::ReplicaClient`].

use crate::errors::BuildError;
use crate::types::{ConfigurationSetting, SettingSelector};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

const API_VERSION: &str = "1.0";
const USER_AGENT: &str = concat!("appconfig-refresher/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("upstream returned status {status}")]
    Status { status: u16 },
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    /// The request never got a response: connection refused or reset, DNS failure.
    #[error("replica unreachable: {0}")]
    Unreachable(reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status } => Some(*status),
            TransportError::Request(err) => err.status().map(|s| s.as_u16()),
            TransportError::Unreachable(_) | TransportError::InvalidUrl(_) => None,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        // A client-side timeout is reported the same way as a server-side one
        if err.is_timeout() {
            return TransportError::Status {
                status: StatusCode::REQUEST_TIMEOUT.as_u16(),
            };
        }
        if err.is_connect() || (err.is_request() && err.status().is_none()) {
            return TransportError::Unreachable(err);
        }
        TransportError::Request(err)
    }
}

#[async_trait]
pub trait ConfigurationTransport: Send + Sync {
    /// Fetches a single setting. A missing setting is reported as status 404.
    async fn get_setting(
        &self,
        key: &str,
        label: &str,
    ) -> Result<ConfigurationSetting, TransportError>;

    /// Lists every setting matching the selector, across all pages.
    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, TransportError>;
}

/// Creates the transport for one replica endpoint.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn ConfigurationTransport>, BuildError>;
}

#[derive(Deserialize)]
struct SettingsPage {
    items: Vec<ConfigurationSetting>,
    #[serde(rename = "@nextLink")]
    next_link: Option<String>,
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Result<Self, TransportError> {
        let endpoint = Url::parse(endpoint).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(TransportError::InvalidUrl(endpoint.to_string()));
        }
        Ok(HttpTransport { client, endpoint })
    }

    fn kv_url(&self, key: Option<&str>) -> Result<Url, TransportError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| TransportError::InvalidUrl(self.endpoint.to_string()))?;
            segments.pop_if_empty().push("kv");
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<T, TransportError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ConfigurationTransport for HttpTransport {
    async fn get_setting(
        &self,
        key: &str,
        label: &str,
    ) -> Result<ConfigurationSetting, TransportError> {
        let mut url = self.kv_url(Some(key))?;
        url.query_pairs_mut()
            .append_pair("label", label)
            .append_pair("api-version", API_VERSION);

        self.fetch(url).await
    }

    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, TransportError> {
        let mut url = self.kv_url(None)?;
        url.query_pairs_mut()
            .append_pair("key", &selector.key_filter)
            .append_pair("label", &selector.label_filter)
            .append_pair("api-version", API_VERSION);

        let mut settings = Vec::new();
        let mut page_fetches = 0;

        loop {
            let page: SettingsPage = self.fetch(url).await?;
            settings.extend(page.items);
            page_fetches += 1;

            match page.next_link {
                Some(link) => {
                    url = self
                        .endpoint
                        .join(&link)
                        .map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
                }
                None => break,
            }
        }

        tracing::trace!(
            endpoint = %self.endpoint,
            pages = page_fetches,
            count = settings.len(),
            "Listed settings"
        );

        Ok(settings)
    }
}

/// Builds reqwest-backed transports that share one connection pool.
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    pub fn new(request_timeout: Duration) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(HttpTransportFactory { client })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn ConfigurationTransport>, BuildError> {
        let transport = HttpTransport::new(self.client.clone(), endpoint).map_err(|e| {
            BuildError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Arc::new(transport))
    }
}
