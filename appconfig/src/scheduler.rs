use crate::backoff::FAR_FUTURE;
use crate::errors::RefreshError;
use crate::pull_refresh::PullRefresh;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug)]
pub enum Command {
    // Run a refresh cycle outside of the normal interval.
    // The worker sends the cycle result back when it finishes.
    Refresh(oneshot::Sender<Result<bool, RefreshError>>),
    // Stop the worker after the running cycle completes.
    Shutdown,
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("refresh scheduler is not running")]
    Stopped,
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("refresh worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs refresh cycles on a fixed poll interval in a background task.
pub struct RefreshScheduler {
    tx: mpsc::Sender<Command>,
    handle: tokio::task::JoinHandle<()>,
}

impl RefreshScheduler {
    /// Spawns the worker. The first cycle runs one poll interval from now.
    pub fn spawn(engine: Arc<PullRefresh>, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(16);
        let handle = tokio::spawn(run(engine, poll_interval, rx));
        RefreshScheduler { tx, handle }
    }

    /// Runs a cycle now and waits for its result.
    pub async fn refresh(&self) -> Result<bool, SchedulerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh(reply_tx))
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(reply_rx.await.map_err(|_| SchedulerError::Stopped)??)
    }

    pub async fn shutdown(self) -> Result<(), SchedulerError> {
        // The worker may already be gone, in which case there is nothing to stop
        let _ = self.tx.send(Command::Shutdown).await;
        self.handle.await?;
        Ok(())
    }
}

async fn run(engine: Arc<PullRefresh>, poll_interval: Duration, mut rx: mpsc::Receiver<Command>) {
    let now = Instant::now();
    let start = now
        .checked_add(poll_interval)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now);
    let mut ticker = tokio::time::interval_at(start, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = engine.refresh_configurations().await {
                    tracing::error!(error = %err, "Scheduled refresh failed");
                }
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Refresh(reply)) => {
                    // The caller may have given up waiting
                    let _ = reply.send(engine.refresh_configurations().await);
                }
                Some(Command::Shutdown) | None => {
                    tracing::info!("Refresh scheduler stopped");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, StoreConfig, TriggerConfig};
    use crate::connection_manager::ReplicaClientFactory;
    use crate::state_holder::StateHolder;
    use crate::testutils::{MockTransport, RecordingPublisher, connection};
    use crate::types::{NULL_LABEL, WatchKey};

    const ORIGIN: &str = "https://store1.azconfig.io";

    fn engine(transport: Arc<MockTransport>) -> (Arc<PullRefresh>, Arc<RecordingPublisher>) {
        let mut store = StoreConfig::with_endpoints([ORIGIN]);
        store.monitoring.enabled = true;
        store.monitoring.refresh_interval_secs = -1;
        store.monitoring.triggers = vec![TriggerConfig::new("sentinel", NULL_LABEL)];

        let factory = ReplicaClientFactory::from_connections([connection(store, &[transport])]);
        let state_holder = Arc::new(StateHolder::new());
        let mut pending = state_holder.pending();
        pending.set_state(
            ORIGIN,
            vec![WatchKey::new("sentinel", NULL_LABEL, Some("etag1".into()))],
            -1,
        );
        state_holder.update_state(pending);

        let publisher = Arc::new(RecordingPublisher::default());
        let config = ProviderConfig {
            stores: Vec::new(),
            refresh_interval_secs: None,
            min_backoff_secs: 30,
            max_backoff_secs: 600,
            request_timeout_secs: 10,
        };
        let engine = PullRefresh::new(
            Arc::new(factory),
            state_holder,
            publisher.clone(),
            &config,
        );
        (Arc::new(engine), publisher)
    }

    #[tokio::test]
    async fn test_refresh_on_demand() {
        let transport = MockTransport::new();
        transport.set_setting("sentinel", NULL_LABEL, "etag1");
        let (engine, publisher) = engine(transport.clone());

        let scheduler = RefreshScheduler::spawn(engine, Duration::from_secs(3600));
        assert!(!scheduler.refresh().await.unwrap());

        transport.set_setting("sentinel", NULL_LABEL, "etag2");
        assert!(scheduler.refresh().await.unwrap());
        assert_eq!(publisher.events().len(), 1);

        // Errors from the cycle are handed back to the caller
        transport.fail_with_status(401);
        assert!(matches!(
            scheduler.refresh().await,
            Err(SchedulerError::Refresh(RefreshError::StoreFailed { .. }))
        ));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduled_refresh() {
        let transport = MockTransport::new();
        transport.set_setting("sentinel", NULL_LABEL, "etag2");
        let (engine, publisher) = engine(transport.clone());

        let scheduler = RefreshScheduler::spawn(engine, Duration::from_millis(10));
        for _ in 0..200 {
            if !publisher.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publisher.events().len(), 1);
        assert!(transport.calls() >= 1);

        scheduler.shutdown().await.unwrap();
    }
}
