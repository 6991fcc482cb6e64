use crate::config::{StoreConfig, ValidationError};
use crate::errors::BuildError;
use crate::replica_client::ReplicaClient;
use crate::transport::TransportFactory;
use std::sync::Arc;

/// Creates the replica clients of a store. The first client returned is the
/// origin and its endpoint identifies the store everywhere else.
pub struct ReplicaClientsBuilder {
    transport_factory: Arc<dyn TransportFactory>,
}

impl ReplicaClientsBuilder {
    pub fn new(transport_factory: Arc<dyn TransportFactory>) -> Self {
        ReplicaClientsBuilder { transport_factory }
    }

    pub fn build_clients(&self, store: &StoreConfig) -> Result<Vec<Arc<ReplicaClient>>, BuildError> {
        let endpoints = store.endpoint_list().map_err(|e| match e {
            ValidationError::InvalidConnectionString(part) => {
                BuildError::InvalidConnectionString(format!("missing {part}"))
            }
            ValidationError::MissingConnection => BuildError::NoEndpoints,
            other => BuildError::InvalidConnectionString(other.to_string()),
        })?;

        if endpoints.is_empty() {
            return Err(BuildError::NoEndpoints);
        }

        let mut clients = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            // The same endpoint listed twice would only be backed off twice as fast
            if clients
                .iter()
                .any(|c: &Arc<ReplicaClient>| c.endpoint() == endpoint)
            {
                tracing::warn!(endpoint = %endpoint, "Ignoring duplicate replica endpoint");
                continue;
            }

            let transport = self.transport_factory.create(&endpoint)?;
            clients.push(Arc::new(ReplicaClient::new(endpoint, transport)));
        }

        Ok(clients)
    }
}
