//! Change detection for configured stores.
//!
//! Stores are checked one after another. A store is checked when it is due
//! (its timer expired, it was never loaded, or a forced refresh is running);
//! its watch keys and feature flags are fetched from the first available
//! replica and compared against the cached state in the pending snapshot.

use crate::config::{FeatureFlagStoreConfig, TriggerConfig};
use crate::connection_manager::{ConnectionManager, ReplicaClientFactory};
use crate::errors::{RefreshError, ReplicaError};
use crate::metrics_defs::REFRESH_STORE_FAILED;
use crate::replica_client::ReplicaClient;
use crate::state_holder::{State, StateSnapshot};
use crate::types::{ConfigurationSetting, WatchKey};
use shared::counter;
use std::sync::Arc;
use std::time::Instant;

/// Outcome of one refresh check across every store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshEventData {
    triggers: Vec<String>,
}

impl RefreshEventData {
    /// Whether any store changed.
    pub fn do_refresh(&self) -> bool {
        !self.triggers.is_empty()
    }

    pub fn triggers(&self) -> &[String] {
        &self.triggers
    }

    pub fn message(&self) -> String {
        format!(
            "Configuration refresh event triggered by: {}",
            self.triggers.join(", ")
        )
    }

    fn record(&mut self, trigger: String) {
        self.triggers.push(trigger);
    }
}

/// Everything fetched for a store in one check. `None` means that part was
/// not due.
#[derive(Debug, Default)]
struct StoreCheck {
    watch_keys: Option<Vec<WatchKey>>,
    feature_flags: Option<Vec<WatchKey>>,
}

fn is_due(state: Option<&State>, now: Instant, forced: bool) -> bool {
    forced || state.is_none_or(|s| s.is_due(now))
}

/// Checks every due store for change and writes the new states of the stores
/// that were checked successfully into `snapshot`.
///
/// A store that fails on every available replica is left untouched. When it is
/// fail-fast the whole check is aborted with [`RefreshError::StoreFailed`],
/// otherwise the failure is logged and the remaining stores are checked.
pub async fn refresh_stores_check(
    factory: &ReplicaClientFactory,
    snapshot: &mut StateSnapshot,
    forced: bool,
) -> Result<RefreshEventData, RefreshError> {
    let mut event_data = RefreshEventData::default();
    let now = Instant::now();

    for connection in factory.connections() {
        let store = connection.store();
        let origin = connection.origin();

        if !store.enabled {
            continue;
        }

        let config_due =
            store.monitoring.enabled && is_due(snapshot.get_state(origin), now, forced);
        let flags_due = store.feature_flags.enabled
            && is_due(snapshot.get_state_feature_flag(origin), now, forced);

        if !config_due && !flags_due {
            tracing::debug!(store = %origin, "Skipping refresh check, store not due");
            continue;
        }

        let clients = factory.available_clients(origin, forced);
        if clients.is_empty() {
            tracing::debug!(store = %origin, "Skipping refresh check, no replica available");
            continue;
        }

        let result = factory
            .with_failover(origin, &clients, |client| {
                fetch_store(client, connection, config_due, flags_due)
            })
            .await;

        match result {
            Ok(check) => apply_check(connection, snapshot, check, &mut event_data),
            Err(err) => {
                counter!(REFRESH_STORE_FAILED).increment(1);
                if store.fail_fast {
                    return Err(RefreshError::StoreFailed {
                        store: origin.to_string(),
                        source: err,
                    });
                }
                tracing::warn!(
                    store = %origin,
                    error = %err,
                    "Refresh check failed, store will be retried when next due"
                );
            }
        }
    }

    Ok(event_data)
}

async fn fetch_store(
    client: Arc<ReplicaClient>,
    connection: &ConnectionManager,
    config_due: bool,
    flags_due: bool,
) -> Result<StoreCheck, ReplicaError> {
    let store = connection.store();
    let mut check = StoreCheck::default();

    if config_due {
        check.watch_keys = Some(fetch_watch_keys(&client, &store.monitoring.triggers).await?);
    }

    if flags_due {
        let flags = fetch_feature_flags(&client, &store.feature_flags).await?;
        check.feature_flags = Some(flags.iter().map(WatchKey::from).collect());
    }

    Ok(check)
}

fn apply_check(
    connection: &ConnectionManager,
    snapshot: &mut StateSnapshot,
    check: StoreCheck,
    event_data: &mut RefreshEventData,
) {
    let origin = connection.origin();
    let monitoring = &connection.store().monitoring;

    if let Some(watch_keys) = check.watch_keys {
        for key in changed_watch_keys(snapshot.get_state(origin), &watch_keys) {
            tracing::info!(store = %origin, key = %key.key, label = ?key.label, "Watch key changed");
            event_data.record(format!("{origin}/{}", key.key));
        }
        snapshot
            .set_state(origin, watch_keys, monitoring.refresh_interval_secs)
            .set_load_state(origin, true);
    }

    if let Some(flags) = check.feature_flags {
        if feature_flags_changed(snapshot.get_state_feature_flag(origin), &flags) {
            tracing::info!(store = %origin, "Feature flags changed");
            event_data.record(format!("{origin}/feature flags"));
        }
        snapshot
            .set_state_feature_flag(origin, flags, monitoring.feature_flag_refresh_interval_secs)
            .set_load_state_feature_flag(origin, true);
    }
}

/// Re-fetches the watch keys and feature flags of a store through `client`,
/// ignoring refresh timers, and reports whether either differs from the cached
/// state. Used after a failed load to decide whether the previous
/// configuration of the store is still current.
pub async fn check_store_after_refresh_failed(
    factory: &ReplicaClientFactory,
    origin: &str,
    client: &ReplicaClient,
    snapshot: &StateSnapshot,
) -> Result<bool, ReplicaError> {
    let Some(connection) = factory.connection(origin) else {
        return Ok(false);
    };
    let store = connection.store();

    if store.monitoring.enabled {
        let watch_keys = fetch_watch_keys(client, &store.monitoring.triggers).await?;
        if !changed_watch_keys(snapshot.get_state(origin), &watch_keys).is_empty() {
            return Ok(true);
        }
    }

    if store.feature_flags.enabled {
        let flags: Vec<WatchKey> = fetch_feature_flags(client, &store.feature_flags)
            .await?
            .iter()
            .map(WatchKey::from)
            .collect();
        if feature_flags_changed(snapshot.get_state_feature_flag(origin), &flags) {
            return Ok(true);
        }
    }

    Ok(false)
}

/// One call per trigger. Missing settings are kept as absent watch keys.
pub(crate) async fn fetch_watch_keys(
    client: &ReplicaClient,
    triggers: &[TriggerConfig],
) -> Result<Vec<WatchKey>, ReplicaError> {
    let mut watch_keys = Vec::with_capacity(triggers.len());
    for trigger in triggers {
        let watch_key = match client.get_watch_key(&trigger.key, &trigger.label).await? {
            Some(setting) => WatchKey::from(&setting),
            None => WatchKey::absent(&trigger.key, &trigger.label),
        };
        watch_keys.push(watch_key);
    }
    Ok(watch_keys)
}

pub(crate) async fn fetch_feature_flags(
    client: &ReplicaClient,
    feature_flags: &FeatureFlagStoreConfig,
) -> Result<Vec<ConfigurationSetting>, ReplicaError> {
    let mut flags: Vec<ConfigurationSetting> = Vec::new();
    for selector in &feature_flags.selects {
        for flag in client
            .list_configuration_settings(&selector.feature_flags())
            .await?
        {
            // Overlapping selectors return the same flag more than once
            if !flags
                .iter()
                .any(|f| f.key == flag.key && f.label_or_null() == flag.label_or_null())
            {
                flags.push(flag);
            }
        }
    }
    Ok(flags)
}

/// The fetched keys whose ETag differs from the cached one. A key missing on
/// one side and present on the other counts as changed.
fn changed_watch_keys<'a>(cached: Option<&State>, fetched: &'a [WatchKey]) -> Vec<&'a WatchKey> {
    fetched
        .iter()
        .filter(|key| {
            let cached_etag = cached
                .and_then(|s| s.watch_keys().iter().find(|w| w.matches(&key.key, &key.label)))
                .and_then(|w| w.etag.as_deref());
            cached_etag != key.etag.as_deref()
        })
        .collect()
}

fn feature_flags_changed(cached: Option<&State>, fetched: &[WatchKey]) -> bool {
    let cached = cached.map(State::watch_keys).unwrap_or_default();

    if cached.len() != fetched.len() {
        return true;
    }

    fetched.iter().any(|flag| {
        !cached
            .iter()
            .any(|c| c.matches(&flag.key, &flag.label) && c.etag == flag.etag)
    })
}
