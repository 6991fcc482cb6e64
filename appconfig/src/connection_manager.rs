use crate::config::{ProviderConfig, StoreConfig};
use crate::errors::{BuildError, ReplicaError};
use crate::metrics_defs::{REPLICA_BACKOFF, REPLICA_FAILOVER};
use crate::replica_client::ReplicaClient;
use crate::replica_clients_builder::ReplicaClientsBuilder;
use indexmap::IndexMap;
use parking_lot::RwLock;
use shared::counter;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaHealth {
    Up,
    Down,
}

/// Owns every replica client of one store.
///
/// The client list always contains at least the origin, followed by the
/// replicas in their configured failover order.
pub struct ConnectionManager {
    origin: String,
    store: StoreConfig,
    clients: Vec<Arc<ReplicaClient>>,
    min_backoff: Duration,
    max_backoff: Duration,
    // Endpoint of the replica that last served a request
    current: RwLock<Option<String>>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("origin", &self.origin)
            .field("clients", &self.clients)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        store: StoreConfig,
        clients: Vec<Arc<ReplicaClient>>,
        min_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self, BuildError> {
        let origin = clients
            .first()
            .map(|c| c.endpoint().to_string())
            .ok_or(BuildError::NoEndpoints)?;

        Ok(ConnectionManager {
            origin,
            store,
            clients,
            min_backoff,
            max_backoff,
            current: RwLock::new(None),
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn store(&self) -> &StoreConfig {
        &self.store
    }

    pub fn clients(&self) -> &[Arc<ReplicaClient>] {
        &self.clients
    }

    pub fn has_replicas(&self) -> bool {
        self.clients.len() > 1
    }

    /// Clients that are not backed off, origin first. When
    /// `force_refresh_replica` is set and every client is backed off, all
    /// clients are returned so a cold replica is tried rather than none.
    pub fn available_clients(&self, force_refresh_replica: bool) -> Vec<Arc<ReplicaClient>> {
        let available: Vec<_> = self
            .clients
            .iter()
            .filter(|c| c.is_available())
            .cloned()
            .collect();

        if available.is_empty() && force_refresh_replica {
            return self.clients.clone();
        }

        available
    }

    /// Increments the failure count of the client and pushes its backoff end
    /// time out. Unknown endpoints are ignored.
    pub fn backoff_client(&self, endpoint: &str) {
        if let Some(client) = self.clients.iter().find(|c| c.endpoint() == endpoint) {
            let backoff_end = client.backoff(self.min_backoff, self.max_backoff);
            counter!(REPLICA_BACKOFF).increment(1);
            tracing::debug!(
                store = %self.origin,
                endpoint = %endpoint,
                failed_attempts = client.failed_attempts(),
                backoff_secs = backoff_end
                    .saturating_duration_since(std::time::Instant::now())
                    .as_secs(),
                "Backed off replica"
            );
        }
    }

    pub fn health(&self) -> ReplicaHealth {
        if self.clients.iter().any(|c| c.is_available()) {
            ReplicaHealth::Up
        } else {
            ReplicaHealth::Down
        }
    }

    pub fn set_current_client(&self, endpoint: &str) {
        *self.current.write() = Some(endpoint.to_string());
    }

    pub fn current_client(&self) -> Option<String> {
        self.current.read().clone()
    }
}

/// Holds one [`ConnectionManager`] per configured store, in configuration order.
#[derive(Debug, Default)]
pub struct ReplicaClientFactory {
    connections: IndexMap<String, ConnectionManager>,
}

impl ReplicaClientFactory {
    pub fn new(
        config: &ProviderConfig,
        builder: &ReplicaClientsBuilder,
    ) -> Result<Self, BuildError> {
        let mut connections = Vec::with_capacity(config.stores.len());
        for store in &config.stores {
            let clients = builder.build_clients(store)?;
            connections.push(ConnectionManager::new(
                store.clone(),
                clients,
                config.min_backoff(),
                config.max_backoff(),
            )?);
        }
        Ok(Self::from_connections(connections))
    }

    pub fn from_connections(connections: impl IntoIterator<Item = ConnectionManager>) -> Self {
        ReplicaClientFactory {
            connections: connections
                .into_iter()
                .map(|c| (c.origin().to_string(), c))
                .collect(),
        }
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnectionManager> {
        self.connections.values()
    }

    pub fn connection(&self, origin: &str) -> Option<&ConnectionManager> {
        self.connections.get(origin)
    }

    pub fn available_clients(
        &self,
        origin: &str,
        force_refresh_replica: bool,
    ) -> Vec<Arc<ReplicaClient>> {
        self.connections
            .get(origin)
            .map(|c| c.available_clients(force_refresh_replica))
            .unwrap_or_default()
    }

    pub fn backoff_client(&self, endpoint: &str) {
        let origin = self.find_origin_for_endpoint(endpoint);
        if let Some(connection) = self.connections.get(&origin) {
            connection.backoff_client(endpoint);
        }
    }

    /// Maps any known replica endpoint to the origin of its store. Unknown
    /// endpoints map to themselves.
    pub fn find_origin_for_endpoint(&self, endpoint: &str) -> String {
        let trimmed = endpoint.trim_end_matches('/');
        self.connections
            .values()
            .find(|c| c.clients().iter().any(|client| client.endpoint() == trimmed))
            .map(|c| c.origin().to_string())
            .unwrap_or_else(|| endpoint.to_string())
    }

    pub fn has_replicas(&self, endpoint: &str) -> bool {
        let origin = self.find_origin_for_endpoint(endpoint);
        self.connections
            .get(&origin)
            .is_some_and(|c| c.has_replicas())
    }

    pub fn set_current_client(&self, origin: &str, endpoint: &str) {
        if let Some(connection) = self.connections.get(origin) {
            connection.set_current_client(endpoint);
        }
    }

    /// Runs `op` against each client in order until one succeeds.
    ///
    /// Clients failing with a retryable error are backed off and the next one is
    /// tried. A non-retryable error is returned immediately. When every client
    /// failed the last retryable error is returned.
    pub async fn with_failover<T, F, Fut>(
        &self,
        origin: &str,
        clients: &[Arc<ReplicaClient>],
        mut op: F,
    ) -> Result<T, ReplicaError>
    where
        F: FnMut(Arc<ReplicaClient>) -> Fut,
        Fut: Future<Output = Result<T, ReplicaError>>,
    {
        let mut last_error = None;

        for client in clients {
            match op(client.clone()).await {
                Ok(value) => {
                    self.set_current_client(origin, client.endpoint());
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        store = %origin,
                        endpoint = %client.endpoint(),
                        error = %err,
                        "Replica request failed, trying next replica"
                    );
                    counter!(REPLICA_FAILOVER).increment(1);
                    self.backoff_client(client.endpoint());
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or_else(|| ReplicaError::NoAvailableReplicas {
            origin: origin.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockTransport, connection};
    use crate::types::NULL_LABEL;
    use std::time::Instant;

    const ORIGIN: &str = "https://store1.azconfig.io";
    const REPLICA: &str = "https://store1-replica.azconfig.io";

    fn store_with_replica() -> (Arc<MockTransport>, Arc<MockTransport>, ReplicaClientFactory) {
        let origin = MockTransport::new();
        let replica = MockTransport::new();
        let connection = connection(
            StoreConfig::with_endpoints([ORIGIN, REPLICA]),
            &[origin.clone(), replica.clone()],
        );
        (origin, replica, ReplicaClientFactory::from_connections([connection]))
    }

    #[test]
    fn test_single_client_store() {
        let connection = connection(StoreConfig::with_endpoints([ORIGIN]), &[MockTransport::new()]);
        assert_eq!(connection.origin(), ORIGIN);
        assert!(!connection.has_replicas());
        assert_eq!(connection.available_clients(false).len(), 1);
        assert_eq!(connection.health(), ReplicaHealth::Up);
    }

    #[test]
    fn test_connection_requires_a_client() {
        let result = ConnectionManager::new(
            StoreConfig::with_endpoints([ORIGIN]),
            Vec::new(),
            Duration::from_secs(30),
            Duration::from_secs(600),
        );
        assert!(matches!(result, Err(BuildError::NoEndpoints)));
    }

    #[test]
    fn test_available_clients_order_and_backoff() {
        let (_origin, _replica, factory) = store_with_replica();

        let endpoints: Vec<String> = factory
            .available_clients(ORIGIN, false)
            .iter()
            .map(|c| c.endpoint().to_string())
            .collect();
        assert_eq!(endpoints, vec![ORIGIN, REPLICA]);

        factory.backoff_client(ORIGIN);
        let available = factory.available_clients(ORIGIN, false);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].endpoint(), REPLICA);
        assert_eq!(factory.connection(ORIGIN).unwrap().health(), ReplicaHealth::Up);

        factory.backoff_client(REPLICA);
        assert!(factory.available_clients(ORIGIN, false).is_empty());
        assert_eq!(factory.connection(ORIGIN).unwrap().health(), ReplicaHealth::Down);

        // Forced refresh falls back to every client, origin first
        let forced = factory.available_clients(ORIGIN, true);
        assert_eq!(forced.len(), 2);
        assert_eq!(forced[0].endpoint(), ORIGIN);
    }

    #[test]
    fn test_find_origin_for_endpoint() {
        let (_origin, _replica, factory) = store_with_replica();

        assert_eq!(factory.find_origin_for_endpoint(ORIGIN), ORIGIN);
        assert_eq!(factory.find_origin_for_endpoint(REPLICA), ORIGIN);
        assert_eq!(
            factory.find_origin_for_endpoint(&format!("{REPLICA}/")),
            ORIGIN
        );
        assert_eq!(
            factory.find_origin_for_endpoint("https://unknown.azconfig.io"),
            "https://unknown.azconfig.io"
        );
        assert_eq!(
            factory.find_origin_for_endpoint("https://unknown.azconfig.io/"),
            "https://unknown.azconfig.io/"
        );

        assert!(factory.has_replicas(REPLICA));
        assert!(!factory.has_replicas("https://unknown.azconfig.io"));
        assert!(factory.available_clients("https://unknown.azconfig.io", true).is_empty());
    }

    #[tokio::test]
    async fn test_failover_to_replica() {
        let (origin, replica, factory) = store_with_replica();
        origin.fail_with_status(429);
        replica.set_setting("sentinel", NULL_LABEL, "etag1");

        let clients = factory.available_clients(ORIGIN, false);
        let setting = factory
            .with_failover(ORIGIN, &clients, |client| async move {
                client.get_watch_key("sentinel", NULL_LABEL).await
            })
            .await
            .unwrap();

        assert_eq!(setting.unwrap().etag.as_deref(), Some("etag1"));
        let connection = factory.connection(ORIGIN).unwrap();
        assert!(connection.clients()[0].backoff_end_time() > Instant::now());
        assert_eq!(connection.clients()[0].failed_attempts(), 1);
        assert_eq!(connection.current_client().as_deref(), Some(REPLICA));
    }

    #[tokio::test]
    async fn test_failover_exhausted() {
        let (origin, replica, factory) = store_with_replica();
        origin.fail_with_status(500);
        replica.fail_with_status(503);

        let clients = factory.available_clients(ORIGIN, false);
        let err = factory
            .with_failover(ORIGIN, &clients, |client| async move {
                client.get_watch_key("sentinel", NULL_LABEL).await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicaError::Retryable { status: 503, .. }));
        assert_eq!(origin.calls(), 1);
        assert_eq!(replica.calls(), 1);

        let err = factory
            .with_failover(ORIGIN, &[], |client| async move {
                client.get_watch_key("sentinel", NULL_LABEL).await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NoAvailableReplicas { .. }));
    }

    #[tokio::test]
    async fn test_non_retryable_stops_failover() {
        let (origin, replica, factory) = store_with_replica();
        origin.fail_with_status(401);
        replica.set_setting("sentinel", NULL_LABEL, "etag1");

        let clients = factory.available_clients(ORIGIN, false);
        let err = factory
            .with_failover(ORIGIN, &clients, |client| async move {
                client.get_watch_key("sentinel", NULL_LABEL).await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicaError::NonRetryable { .. }));
        assert_eq!(replica.calls(), 0);
        // Non-retryable failures do not back off the client
        assert!(factory.connection(ORIGIN).unwrap().clients()[0].is_available());
    }

    #[tokio::test]
    async fn test_failover_from_unreachable_origin() {
        use crate::transport::HttpTransportFactory;
        use serde_json::json;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let replica_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/kv/sentinel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "key": "sentinel",
                "value": "1",
                "etag": "etag1"
            })))
            .expect(1)
            .mount(&replica_server)
            .await;

        // Nothing listens on port 1
        let dead_origin = "http://127.0.0.1:1";
        let store = StoreConfig::with_endpoints([dead_origin.to_string(), replica_server.uri()]);
        let transport_factory = HttpTransportFactory::new(Duration::from_secs(5)).unwrap();
        let builder = ReplicaClientsBuilder::new(Arc::new(transport_factory));
        let clients = builder.build_clients(&store).unwrap();
        let factory = ReplicaClientFactory::from_connections([ConnectionManager::new(
            store,
            clients,
            Duration::from_secs(30),
            Duration::from_secs(600),
        )
        .unwrap()]);

        let clients = factory.available_clients(dead_origin, false);
        let setting = factory
            .with_failover(dead_origin, &clients, |client| async move {
                client.get_watch_key("sentinel", NULL_LABEL).await
            })
            .await
            .unwrap();

        assert_eq!(setting.unwrap().etag.as_deref(), Some("etag1"));
        let connection = factory.connection(dead_origin).unwrap();
        assert_eq!(connection.clients()[0].failed_attempts(), 1);
        assert_eq!(
            connection.current_client().as_deref(),
            Some(replica_server.uri().as_str())
        );
    }
}
