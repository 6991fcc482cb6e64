use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned by a single replica call.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// 408, 429 or 5xx. The caller should back off this replica and try the next one.
    #[error("replica {endpoint} returned retryable status {status}")]
    Retryable { endpoint: String, status: u16 },

    /// No response at all. Handled like a retryable status.
    #[error("replica {endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    /// Any other transport failure. Failover is not attempted.
    #[error("replica {endpoint} request failed: {source}")]
    NonRetryable {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("no replica available for {origin}")]
    NoAvailableReplicas { origin: String },
}

impl ReplicaError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicaError::Retryable { .. } | ReplicaError::Unreachable { .. }
        )
    }
}

/// Store and cycle level failures surfaced to the scheduler.
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Failed to generate property sources for {store}")]
    StoreFailed {
        store: String,
        #[source]
        source: ReplicaError,
    },

    #[error("refresh permit unavailable: {0}")]
    ConcurrentRefresh(#[from] tokio::sync::AcquireError),
}

/// Errors building replica clients from store configuration.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("store has no endpoint configured")]
    NoEndpoints,

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}
