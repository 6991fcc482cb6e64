use crate::config::StoreConfig;
use crate::connection_manager::ConnectionManager;
use crate::errors::BuildError;
use crate::events::{RefreshEvent, RefreshEventPublisher};
use crate::replica_client::ReplicaClient;
use crate::transport::{ConfigurationTransport, TransportError, TransportFactory};
use crate::types::{ConfigurationSetting, SettingSelector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

enum MockFailure {
    Status(u16),
    InvalidUrl,
}

#[derive(Default)]
struct MockState {
    settings: Vec<ConfigurationSetting>,
    failure: Option<MockFailure>,
    list_failure: Option<u16>,
    calls: usize,
}

/// In-memory transport with scripted settings and failures.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport::default())
    }

    /// Inserts or replaces the setting with this key and label.
    pub fn set_setting(&self, key: &str, label: &str, etag: &str) {
        let mut state = self.state.lock();
        state
            .settings
            .retain(|s| !(s.key == key && s.label_or_null() == label));
        state
            .settings
            .push(ConfigurationSetting::new(key, label, etag));
    }

    pub fn remove_setting(&self, key: &str, label: &str) {
        self.state
            .lock()
            .settings
            .retain(|s| !(s.key == key && s.label_or_null() == label));
    }

    pub fn fail_with_status(&self, status: u16) {
        self.state.lock().failure = Some(MockFailure::Status(status));
    }

    pub fn fail_with_invalid_url(&self) {
        self.state.lock().failure = Some(MockFailure::InvalidUrl);
    }

    /// Fails only listings, single settings are still served.
    pub fn fail_list_with_status(&self, status: u16) {
        self.state.lock().list_failure = Some(status);
    }

    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.failure = None;
        state.list_failure = None;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    fn begin_call(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.calls += 1;
        match state.failure {
            Some(MockFailure::Status(status)) => Err(TransportError::Status { status }),
            Some(MockFailure::InvalidUrl) => Err(TransportError::InvalidUrl("mock".into())),
            None => Ok(()),
        }
    }
}

fn matches_filter(filter: &str, value: &str) -> bool {
    match filter.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => filter == value,
    }
}

#[async_trait]
impl ConfigurationTransport for MockTransport {
    async fn get_setting(
        &self,
        key: &str,
        label: &str,
    ) -> Result<ConfigurationSetting, TransportError> {
        self.begin_call()?;
        self.state
            .lock()
            .settings
            .iter()
            .find(|s| s.key == key && s.label_or_null() == label)
            .cloned()
            .ok_or(TransportError::Status { status: 404 })
    }

    async fn list_settings(
        &self,
        selector: &SettingSelector,
    ) -> Result<Vec<ConfigurationSetting>, TransportError> {
        self.begin_call()?;
        let state = self.state.lock();
        if let Some(status) = state.list_failure {
            return Err(TransportError::Status { status });
        }
        Ok(state
            .settings
            .iter()
            .filter(|s| matches_filter(&selector.key_filter, &s.key))
            .filter(|s| matches_filter(&selector.label_filter, s.label_or_null()))
            .cloned()
            .collect())
    }
}

/// Hands out a [`MockTransport`] per endpoint, creating it on first use.
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn transport(&self, endpoint: &str) -> Arc<MockTransport> {
        self.transports
            .lock()
            .entry(endpoint.to_string())
            .or_insert_with(MockTransport::new)
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, endpoint: &str) -> Result<Arc<dyn ConfigurationTransport>, BuildError> {
        Ok(self.transport(endpoint))
    }
}

/// Builds a connection for the store using one transport per endpoint, in order.
pub fn connection(store: StoreConfig, transports: &[Arc<MockTransport>]) -> ConnectionManager {
    let clients = store
        .endpoint_list()
        .unwrap()
        .into_iter()
        .zip(transports)
        .map(|(endpoint, transport)| {
            let transport: Arc<dyn ConfigurationTransport> = transport.clone();
            Arc::new(ReplicaClient::new(endpoint, transport))
        })
        .collect();

    ConnectionManager::new(
        store,
        clients,
        Duration::from_secs(30),
        Duration::from_secs(600),
    )
    .unwrap()
}

/// Records every published event.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<RefreshEvent>>,
}

impl RecordingPublisher {
    pub fn events(&self) -> Vec<RefreshEvent> {
        self.events.lock().clone()
    }
}

impl RefreshEventPublisher for RecordingPublisher {
    fn publish(&self, event: RefreshEvent) {
        self.events.lock().push(event);
    }
}
