use crate::connection_manager::{ReplicaClientFactory, ReplicaHealth};
use crate::state_holder::StateHolder;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StoreHealth {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
    #[serde(rename = "NOT LOADED")]
    NotLoaded,
}

impl fmt::Display for StoreHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoreHealth::Up => "UP",
            StoreHealth::Down => "DOWN",
            StoreHealth::NotLoaded => "NOT LOADED",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: StoreHealth,
    pub stores: IndexMap<String, StoreHealth>,
}

impl HealthReport {
    /// Down iff any enabled store is down.
    pub fn is_healthy(&self) -> bool {
        self.status != StoreHealth::Down
    }

    /// Ready once any store has loaded.
    pub fn is_ready(&self) -> bool {
        self.stores.values().any(|h| *h == StoreHealth::Up)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"status\":\"{}\"}}", self.status))
    }
}

/// Health of every enabled store. A store with no available replica is down,
/// one whose configuration never loaded is not loaded, any other is up.
pub fn health_report(factory: &ReplicaClientFactory, state_holder: &StateHolder) -> HealthReport {
    let snapshot = state_holder.current();

    let stores: IndexMap<String, StoreHealth> = factory
        .connections()
        .filter(|c| c.store().enabled)
        .map(|connection| {
            let origin = connection.origin();
            let health = if connection.health() == ReplicaHealth::Down {
                StoreHealth::Down
            } else if !snapshot.get_load_state(origin) {
                StoreHealth::NotLoaded
            } else {
                StoreHealth::Up
            };
            (origin.to_string(), health)
        })
        .collect();

    let status = if stores.values().any(|h| *h == StoreHealth::Down) {
        StoreHealth::Down
    } else {
        StoreHealth::Up
    };

    HealthReport { status, stores }
}
