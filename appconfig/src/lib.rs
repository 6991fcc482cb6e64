//! Replica aware configuration loading and refresh for App Configuration stores.
//!
//! A store may be served by several replica endpoints. Requests go to the first
//! replica that is not backed off and fail over to the next one on retryable
//! errors. [`PullRefresh`] polls the watch keys of every store and publishes a
//! [`RefreshEvent`] when one of them changed.

pub mod backoff;
pub mod config;
pub mod connection_manager;
pub mod errors;
pub mod events;
pub mod health;
pub mod loader;
pub mod metrics_defs;
pub mod pull_refresh;
pub mod refresh_util;
pub mod replica_client;
pub mod replica_clients_builder;
pub mod scheduler;
pub mod state_holder;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutils;

pub use config::ProviderConfig;
pub use connection_manager::ReplicaClientFactory;
pub use errors::{BuildError, RefreshError, ReplicaError};
pub use events::{RefreshEvent, RefreshEventPublisher};
pub use health::{HealthReport, StoreHealth, health_report};
pub use loader::LoadedStore;
pub use pull_refresh::PullRefresh;
pub use replica_clients_builder::ReplicaClientsBuilder;
pub use scheduler::RefreshScheduler;
pub use state_holder::StateHolder;
pub use transport::HttpTransportFactory;
