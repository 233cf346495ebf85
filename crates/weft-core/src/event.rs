use crate::types::FlowEvent;

/// Flow lifecycle hub using a tokio broadcast channel.
/// All subscribers receive all events; nothing is persisted.
pub struct FlowEventHub {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl FlowEventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for FlowEventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
