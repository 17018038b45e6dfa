//! Broadcast bus for engine lifecycle notifications.
//!
//! The flow and correlation engines share one `EventBus`. Observers either
//! take every `EngineEvent` or follow a single workflow instance, which is how
//! a runtime driver notices cooperative cancellation.

use synapse_types::config::EngineConfig;
use synapse_types::event::EngineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

/// Multi-consumer bus for instance, task and correlation transitions.
///
/// Cloning the bus clones the sender. Publishing with no subscribers drops
/// the event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Create a bus sized by `event_bus_capacity`.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.event_bus_capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe to every future event.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the future events of one workflow instance.
    pub fn subscribe_instance(&self, instance_id: Uuid) -> InstanceEvents {
        InstanceEvents {
            instance_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Publish an event, returning how many subscribers it reached.
    pub fn publish(&self, event: EngineEvent) -> usize {
        match self.sender.send(event) {
            Ok(delivered) => delivered,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(?event, "engine event dropped, no subscribers");
                0
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Subscription filtered to one workflow instance.
pub struct InstanceEvents {
    instance_id: Uuid,
    receiver: broadcast::Receiver<EngineEvent>,
}

impl InstanceEvents {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Next event about the followed instance.
    ///
    /// Returns `Lagged` when events were lost, so the caller can reload the
    /// instance, and `Closed` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Result<EngineEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.instance_id() == Some(self.instance_id) {
                return Ok(event);
            }
        }
    }
}
