use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;
use topup_shared::OrderEvent;

/// One broadcast topic per tenant. Slow subscribers lose the oldest events
/// rather than blocking publishers.
pub struct EventHub {
    capacity: usize,
    topics: RwLock<HashMap<String, broadcast::Sender<OrderEvent>>>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, tenant_id: &str) -> broadcast::Sender<OrderEvent> {
        if let Some(tx) = self
            .topics
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(tenant_id)
        {
            return tx.clone();
        }
        let mut topics = self.topics.write().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(tenant_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<OrderEvent> {
        self.sender(tenant_id).subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: OrderEvent) -> usize {
        let tenant_id = event.tenant_id.clone();
        match self.sender(&tenant_id).send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::debug!("No subscribers on topic {}", tenant_id);
                0
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
