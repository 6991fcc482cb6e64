use crate::backoff::{calculate_backoff, deadline_after};
use crate::errors::ReplicaError;
use crate::transport::{ConfigurationTransport, TransportError};
use crate::types::{ConfigurationSetting, SettingSelector};
use http::StatusCode;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct BackoffState {
    failed_attempts: u32,
    backoff_end: Instant,
}

/// A single network endpoint serving a store's data.
///
/// Besides forwarding calls to its transport, the client keeps the backoff
/// bookkeeping for its endpoint. The owning connection manager advances the
/// backoff on retryable failures and any successful call resets it.
pub struct ReplicaClient {
    endpoint: String,
    transport: Arc<dyn ConfigurationTransport>,
    backoff: Mutex<BackoffState>,
}

impl fmt::Debug for ReplicaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaClient")
            .field("endpoint", &self.endpoint)
            .field("failed_attempts", &self.failed_attempts())
            .finish()
    }
}

impl ReplicaClient {
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn ConfigurationTransport>) -> Self {
        ReplicaClient {
            endpoint: endpoint.into(),
            transport,
            backoff: Mutex::new(BackoffState {
                failed_attempts: 0,
                backoff_end: Instant::now(),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn failed_attempts(&self) -> u32 {
        self.backoff.lock().failed_attempts
    }

    pub fn backoff_end_time(&self) -> Instant {
        self.backoff.lock().backoff_end
    }

    pub fn is_available(&self) -> bool {
        Instant::now() >= self.backoff_end_time()
    }

    /// Fetches the current value of a watch key. Returns `None` when the
    /// setting does not exist.
    pub async fn get_watch_key(
        &self,
        key: &str,
        label: &str,
    ) -> Result<Option<ConfigurationSetting>, ReplicaError> {
        match self.transport.get_setting(key, label).await {
            Ok(setting) => {
                self.reset_backoff();
                Ok(Some(setting))
            }
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND.as_u16()) => {
                self.reset_backoff();
                Ok(None)
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    pub async fn list_configuration_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, ReplicaError> {
        match self.transport.list_settings(selector).await {
            Ok(settings) => {
                self.reset_backoff();
                Ok(settings)
            }
            Err(err) => Err(self.classify(err)),
        }
    }

    /// Records a failed call and moves the backoff end time forward.
    /// Returns the new backoff end time.
    pub(crate) fn backoff(&self, min_backoff: Duration, max_backoff: Duration) -> Instant {
        let mut state = self.backoff.lock();
        state.failed_attempts = state.failed_attempts.saturating_add(1);
        state.backoff_end = deadline_after(
            Instant::now(),
            calculate_backoff(state.failed_attempts, min_backoff, max_backoff),
        );
        state.backoff_end
    }

    fn reset_backoff(&self) {
        let mut state = self.backoff.lock();
        state.failed_attempts = 0;
        state.backoff_end = Instant::now();
    }

    fn classify(&self, err: TransportError) -> ReplicaError {
        if err.is_unreachable() {
            return ReplicaError::Unreachable {
                endpoint: self.endpoint.clone(),
                source: err,
            };
        }
        match err.status() {
            Some(status) if is_retryable_status(status) => ReplicaError::Retryable {
                endpoint: self.endpoint.clone(),
                status,
            },
            _ => ReplicaError::NonRetryable {
                endpoint: self.endpoint.clone(),
                source: err,
            },
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    StatusCode::from_u16(status).is_ok_and(|code| {
        code == StatusCode::REQUEST_TIMEOUT
            || code == StatusCode::TOO_MANY_REQUESTS
            || code.is_server_error()
    })
}
