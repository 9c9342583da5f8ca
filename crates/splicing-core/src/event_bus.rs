use tokio::sync::broadcast;

use splicing_types::EngineEvent;

/// Fan-out of engine events (turn progress, streamed text, block updates) to
/// any number of subscribers. Publishing never blocks; lagging subscribers
/// miss events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::new("block.generated", json!({"blockId": "b1"})));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "block.generated");
        assert_eq!(event.properties["blockId"], "b1");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::default().publish(EngineEvent::new("noop", json!({})));
    }
}
