use tokio::sync::broadcast;

/// Published once per refresh cycle in which at least one store changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshEvent {
    pub message: String,
}

pub trait RefreshEventPublisher: Send + Sync {
    fn publish(&self, event: RefreshEvent);
}

impl RefreshEventPublisher for broadcast::Sender<RefreshEvent> {
    fn publish(&self, event: RefreshEvent) {
        if let Err(err) = self.send(event) {
            tracing::debug!("No subscribers for refresh event: {}", err.0.message);
        }
    }
}
