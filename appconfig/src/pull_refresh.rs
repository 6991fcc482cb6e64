use crate::config::ProviderConfig;
use crate::connection_manager::ReplicaClientFactory;
use crate::errors::RefreshError;
use crate::events::{RefreshEvent, RefreshEventPublisher};
use crate::loader::{ConfigurationLoader, LoadedStore};
use crate::metrics_defs::{REFRESH_CYCLE_DURATION, REFRESH_EVENT_PUBLISHED};
use crate::refresh_util::refresh_stores_check;
use crate::state_holder::StateHolder;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

/// The refresh engine.
///
/// Each call to [`PullRefresh::refresh_configurations`] runs one refresh cycle:
/// every due store is checked for change and the resulting state is committed
/// to the [`StateHolder`] as a single snapshot. At most one cycle runs at a
/// time; concurrent callers wait for the running cycle to finish.
pub struct PullRefresh {
    factory: Arc<ReplicaClientFactory>,
    state_holder: Arc<StateHolder>,
    publisher: Arc<dyn RefreshEventPublisher>,
    // Forced refresh interval. Every store is checked at least this often.
    refresh_interval: Option<Duration>,
    min_backoff: Duration,
    max_backoff: Duration,
    update_lock: Semaphore,
}

impl PullRefresh {
    pub fn new(
        factory: Arc<ReplicaClientFactory>,
        state_holder: Arc<StateHolder>,
        publisher: Arc<dyn RefreshEventPublisher>,
        config: &ProviderConfig,
    ) -> Self {
        PullRefresh {
            factory,
            state_holder,
            publisher,
            refresh_interval: config.refresh_interval(),
            min_backoff: config.min_backoff(),
            max_backoff: config.max_backoff(),
            update_lock: Semaphore::new(1),
        }
    }

    pub fn factory(&self) -> &Arc<ReplicaClientFactory> {
        &self.factory
    }

    pub fn state_holder(&self) -> &Arc<StateHolder> {
        &self.state_holder
    }

    /// Runs one refresh cycle and returns whether any store changed. Exactly one
    /// refresh event is published when it did.
    pub async fn refresh_configurations(&self) -> Result<bool, RefreshError> {
        // Hold permit for the duration of the cycle
        let _permit = self.get_permit().await?;

        let started = Instant::now();
        let result = self.refresh_stores().await;
        histogram!(REFRESH_CYCLE_DURATION).record(started.elapsed().as_secs_f64());

        result
    }

    async fn refresh_stores(&self) -> Result<bool, RefreshError> {
        let mut pending = self.state_holder.pending();

        if let Some(refresh_interval) = self.refresh_interval
            && pending.next_forced_refresh().is_none()
        {
            pending.schedule_forced_refresh(refresh_interval);
        }
        let forced = pending.is_forced_refresh_due(Instant::now());

        match refresh_stores_check(&self.factory, &mut pending, forced).await {
            Ok(event_data) => {
                if forced && let Some(refresh_interval) = self.refresh_interval {
                    pending.schedule_forced_refresh(refresh_interval);
                }
                self.state_holder.update_state(pending);

                if !event_data.do_refresh() {
                    return Ok(false);
                }

                tracing::info!(
                    triggers = ?event_data.triggers(),
                    "Publishing configuration refresh event"
                );
                self.publisher.publish(RefreshEvent {
                    message: event_data.message(),
                });
                counter!(REFRESH_EVENT_PUBLISHED).increment(1);
                Ok(true)
            }
            Err(err) => {
                tracing::error!(error = %err, "Refresh cycle aborted");

                // Stores checked before the failure are discarded so their
                // changes are detected again on the next cycle.
                let mut failed = self.state_holder.pending();
                failed.update_next_refresh_time(
                    self.refresh_interval,
                    self.min_backoff,
                    self.max_backoff,
                );
                self.state_holder.update_state(failed);

                Err(err)
            }
        }
    }

    /// Makes the store owning `endpoint` due on the next cycle. Any replica
    /// endpoint of the store may be given.
    pub async fn expire_refresh_interval(&self, endpoint: &str) -> Result<(), RefreshError> {
        let _permit = self.get_permit().await?;

        let origin = self.factory.find_origin_for_endpoint(endpoint);
        let mut pending = self.state_holder.pending();
        pending.expire_state(&origin);
        self.state_holder.update_state(pending);

        tracing::debug!(store = %origin, "Expired refresh interval");
        Ok(())
    }

    /// Loads the settings and feature flags of every enabled store and resets
    /// their watch state.
    pub async fn load_configurations(&self) -> Result<Vec<LoadedStore>, RefreshError> {
        let _permit = self.get_permit().await?;

        ConfigurationLoader::new(&self.factory, &self.state_holder, self.refresh_interval)
            .load()
            .await
    }

    /// Guard that ensures only one cycle or load is in progress at a time.
    async fn get_permit(&self) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.update_lock.acquire().await
    }
}
