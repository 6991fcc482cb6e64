use crate::connection_manager::{ConnectionManager, ReplicaClientFactory};
use crate::errors::{RefreshError, ReplicaError};
use crate::metrics_defs::REFRESH_STORE_FAILED;
use crate::refresh_util::{check_store_after_refresh_failed, fetch_feature_flags, fetch_watch_keys};
use crate::replica_client::ReplicaClient;
use crate::state_holder::{StateHolder, StateSnapshot};
use crate::types::{ConfigurationSetting, WatchKey};
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

/// Settings and feature flags loaded from one store.
#[derive(Clone, Debug, PartialEq)]
pub struct LoadedStore {
    pub origin: String,
    pub settings: Vec<ConfigurationSetting>,
    pub feature_flags: Vec<ConfigurationSetting>,
}

struct FetchedStore {
    settings: Vec<ConfigurationSetting>,
    feature_flags: Vec<ConfigurationSetting>,
    watch_keys: Vec<WatchKey>,
}

/// Loads every enabled store and records the watch state the refresh engine
/// compares against. States and load flags of all stores are committed in a
/// single snapshot once every store was attempted.
pub struct ConfigurationLoader<'a> {
    factory: &'a ReplicaClientFactory,
    state_holder: &'a StateHolder,
    refresh_interval: Option<Duration>,
}

impl<'a> ConfigurationLoader<'a> {
    pub fn new(
        factory: &'a ReplicaClientFactory,
        state_holder: &'a StateHolder,
        refresh_interval: Option<Duration>,
    ) -> Self {
        ConfigurationLoader {
            factory,
            state_holder,
            refresh_interval,
        }
    }

    pub async fn load(&self) -> Result<Vec<LoadedStore>, RefreshError> {
        let mut pending = self.state_holder.pending();
        let mut loaded = Vec::new();

        for connection in self.factory.connections() {
            let origin = connection.origin();
            let store = connection.store();

            if !store.enabled {
                tracing::debug!(store = %origin, "Skipping disabled store");
                continue;
            }

            // Every client is tried when all of them are backed off
            let clients = self.factory.available_clients(origin, true);
            let result = self
                .factory
                .with_failover(origin, &clients, |client| load_store(client, connection))
                .await;

            let fetched = match result {
                Ok(fetched) => fetched,
                Err(err) => {
                    counter!(REFRESH_STORE_FAILED).increment(1);

                    if pending.get_load_state(origin)
                        && self.unchanged_since_last_load(origin, &clients, &pending).await
                    {
                        tracing::info!(
                            store = %origin,
                            error = %err,
                            "Store could not be loaded but has not changed, keeping previous configuration"
                        );
                        continue;
                    }

                    if store.fail_fast {
                        return Err(RefreshError::StoreFailed {
                            store: origin.to_string(),
                            source: err,
                        });
                    }

                    tracing::warn!(store = %origin, error = %err, "Failed to load store");
                    pending
                        .set_load_state(origin, false)
                        .set_load_state_feature_flag(origin, false);
                    continue;
                }
            };

            let monitoring = &store.monitoring;
            if monitoring.enabled {
                pending.set_state(origin, fetched.watch_keys, monitoring.refresh_interval_secs);
            }
            pending.set_load_state(origin, true);

            if store.feature_flags.enabled {
                pending
                    .set_state_feature_flag(
                        origin,
                        fetched.feature_flags.iter().map(WatchKey::from).collect(),
                        monitoring.feature_flag_refresh_interval_secs,
                    )
                    .set_load_state_feature_flag(origin, true);
            }

            tracing::info!(
                store = %origin,
                settings = fetched.settings.len(),
                feature_flags = fetched.feature_flags.len(),
                "Loaded configuration"
            );
            loaded.push(LoadedStore {
                origin: origin.to_string(),
                settings: fetched.settings,
                feature_flags: fetched.feature_flags,
            });
        }

        if let Some(refresh_interval) = self.refresh_interval {
            pending.schedule_forced_refresh(refresh_interval);
        }
        self.state_holder.update_state(pending);

        Ok(loaded)
    }

    /// Whether any client can confirm the store still matches its cached state.
    async fn unchanged_since_last_load(
        &self,
        origin: &str,
        clients: &[Arc<ReplicaClient>],
        snapshot: &StateSnapshot,
    ) -> bool {
        for client in clients {
            match check_store_after_refresh_failed(self.factory, origin, client, snapshot).await {
                Ok(changed) => return !changed,
                Err(err) => {
                    tracing::debug!(
                        store = %origin,
                        endpoint = %client.endpoint(),
                        error = %err,
                        "Could not check store after failed load"
                    );
                }
            }
        }
        false
    }
}

async fn load_store(
    client: Arc<ReplicaClient>,
    connection: &ConnectionManager,
) -> Result<FetchedStore, ReplicaError> {
    let store = connection.store();

    let mut settings = Vec::new();
    for selector in &store.selects {
        settings.extend(client.list_configuration_settings(selector).await?);
    }

    let feature_flags = if store.feature_flags.enabled {
        fetch_feature_flags(&client, &store.feature_flags).await?
    } else {
        Vec::new()
    };

    let watch_keys = if store.monitoring.enabled {
        fetch_watch_keys(&client, &store.monitoring.triggers).await?
    } else {
        Vec::new()
    };

    Ok(FetchedStore {
        settings,
        feature_flags,
        watch_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, TriggerConfig};
    use crate::testutils::{MockTransport, connection};
    use crate::types::{FEATURE_FLAG_PREFIX, NULL_LABEL};
    use std::time::Instant;

    const ORIGIN: &str = "https://store1.azconfig.io";
    const REPLICA: &str = "https://store1-replica.azconfig.io";

    fn store(endpoints: &[&str]) -> StoreConfig {
        let mut store = StoreConfig::with_endpoints(endpoints.iter().copied());
        store.monitoring.enabled = true;
        store.monitoring.triggers = vec![TriggerConfig::new("sentinel", NULL_LABEL)];
        store.feature_flags.enabled = true;
        store
    }

    fn populated_transport() -> Arc<MockTransport> {
        let transport = MockTransport::new();
        transport.set_setting("/application/app.name", NULL_LABEL, "name-etag");
        transport.set_setting("/application/app.port", NULL_LABEL, "port-etag");
        transport.set_setting("/other/ignored", NULL_LABEL, "ignored-etag");
        transport.set_setting("sentinel", NULL_LABEL, "sentinel-etag");
        transport.set_setting(
            &format!("{FEATURE_FLAG_PREFIX}Alpha"),
            NULL_LABEL,
            "alpha-etag",
        );
        transport
    }

    #[tokio::test]
    async fn test_load_store() {
        let transport = populated_transport();
        let factory = ReplicaClientFactory::from_connections([connection(store(&[ORIGIN]), &[
            transport,
        ])]);
        let state_holder = StateHolder::new();

        let loaded = ConfigurationLoader::new(&factory, &state_holder, None)
            .load()
            .await
            .unwrap();

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].origin, ORIGIN);
        let keys: Vec<&str> = loaded[0].settings.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["/application/app.name", "/application/app.port"]);
        assert_eq!(loaded[0].feature_flags.len(), 1);

        assert!(state_holder.get_load_state(ORIGIN));
        assert!(state_holder.get_load_state_feature_flag(ORIGIN));
        let state = state_holder.get_state(ORIGIN).unwrap();
        assert_eq!(
            state.watch_keys(),
            [WatchKey::new(
                "sentinel",
                NULL_LABEL,
                Some("sentinel-etag".into())
            )]
        );
        assert!(!state.is_due(Instant::now()));
        assert_eq!(
            state_holder
                .get_state_feature_flag(ORIGIN)
                .unwrap()
                .watch_keys()
                .len(),
            1
        );
        assert!(state_holder.current().next_forced_refresh().is_none());
    }

    #[tokio::test]
    async fn test_load_fails_over_and_schedules_forced_refresh() {
        let origin = MockTransport::new();
        origin.fail_with_status(503);
        let factory = ReplicaClientFactory::from_connections([connection(
            store(&[ORIGIN, REPLICA]),
            &[origin, populated_transport()],
        )]);
        let state_holder = StateHolder::new();

        let loaded = ConfigurationLoader::new(&factory, &state_holder, Some(Duration::from_secs(60)))
            .load()
            .await
            .unwrap();

        assert_eq!(loaded[0].settings.len(), 2);
        assert_eq!(
            factory.connection(ORIGIN).unwrap().current_client().as_deref(),
            Some(REPLICA)
        );
        assert!(state_holder.current().next_forced_refresh().is_some());
    }

    #[tokio::test]
    async fn test_fail_fast_load_commits_nothing() {
        let failing = MockTransport::new();
        failing.fail_with_status(403);
        let factory = ReplicaClientFactory::from_connections([
            connection(store(&["https://store0.azconfig.io"]), &[populated_transport()]),
            connection(store(&[ORIGIN]), &[failing]),
        ]);
        let state_holder = StateHolder::new();

        let err = ConfigurationLoader::new(&factory, &state_holder, None)
            .load()
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to generate property sources for {ORIGIN}")
        );
        assert!(!state_holder.get_load_state("https://store0.azconfig.io"));
    }

    #[tokio::test]
    async fn test_best_effort_load_marks_store_not_loaded() {
        let failing = MockTransport::new();
        failing.fail_with_status(500);
        let mut best_effort = store(&[ORIGIN]);
        best_effort.fail_fast = false;
        let mut disabled = store(&["https://store2.azconfig.io"]);
        disabled.enabled = false;
        let factory = ReplicaClientFactory::from_connections([
            connection(best_effort, &[failing]),
            connection(disabled, &[populated_transport()]),
            connection(store(&["https://store3.azconfig.io"]), &[populated_transport()]),
        ]);
        let state_holder = StateHolder::new();

        let loaded = ConfigurationLoader::new(&factory, &state_holder, None)
            .load()
            .await
            .unwrap();

        let origins: Vec<&str> = loaded.iter().map(|l| l.origin.as_str()).collect();
        assert_eq!(origins, vec!["https://store3.azconfig.io"]);
        assert!(!state_holder.get_load_state(ORIGIN));
        assert!(state_holder.get_state(ORIGIN).is_none());
        assert!(!state_holder.get_load_state("https://store2.azconfig.io"));
    }

    #[tokio::test]
    async fn test_reload_keeps_unchanged_store() {
        let transport = populated_transport();
        let mut monitored = store(&[ORIGIN]);
        monitored.feature_flags.enabled = false;
        let factory =
            ReplicaClientFactory::from_connections([connection(monitored, &[transport.clone()])]);
        let state_holder = StateHolder::new();
        let loader = ConfigurationLoader::new(&factory, &state_holder, None);
        loader.load().await.unwrap();

        // Listing fails but the watch keys still match
        transport.fail_list_with_status(404);
        let loaded = loader.load().await.unwrap();
        assert!(loaded.is_empty());
        assert!(state_holder.get_load_state(ORIGIN));

        // Once the sentinel moves the failure is surfaced
        transport.set_setting("sentinel", NULL_LABEL, "sentinel-etag-updated");
        let err = loader.load().await.unwrap_err();
        assert!(matches!(err, RefreshError::StoreFailed { .. }));
    }
}
