use uuid::Uuid;

/// What happened to an order, as seen by subscribers of a tenant topic.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderChange {
    Created,
    Dispatched,
    Approved,
    Rejected,
    SwitchedToManual,
    Redispatched,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub tenant_id: String,
    pub order_id: Uuid,
    pub root_order_id: Uuid,
    pub change: OrderChange,
    pub status: String,
    pub dispatch_state: String,
    pub provider_type: String,
    pub timestamp: i64,
}

impl OrderEvent {
    /// True when the change moved the order into Approved or Rejected.
    pub fn is_terminal(&self) -> bool {
        matches!(self.change, OrderChange::Approved | OrderChange::Rejected)
    }
}
