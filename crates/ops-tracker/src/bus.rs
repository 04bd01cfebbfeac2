use ops_protocol::ProgressEvent;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Process-wide fan-out of validated progress events. The push stream
/// publishes, every live session subscribes and filters by scope.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        trace!(scope = %event.scope, status = %event.status(), "publishing progress");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
