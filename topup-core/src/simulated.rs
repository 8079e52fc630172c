use crate::supplier::{ProviderAdapter, SubmitRequest, SupplierFault};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulatedBehavior {
    #[default]
    Accept,
    /// Answers with an explicit supplier error.
    Reject,
    /// Answers 200 with `status: "failed"` in the body.
    FailedStatus,
    /// Never answers.
    Stall,
}

/// In-process supplier used for local runs and tests.
pub struct SimulatedProvider {
    name: String,
    behavior: Mutex<SimulatedBehavior>,
    latency: Duration,
    balance: f64,
    submits: AtomicUsize,
    cancels: AtomicUsize,
}

impl SimulatedProvider {
    pub fn new(name: &str, behavior: SimulatedBehavior) -> Self {
        Self {
            name: name.to_string(),
            behavior: Mutex::new(behavior),
            latency: Duration::ZERO,
            balance: 100.0,
            submits: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = balance;
        self
    }

    pub fn set_behavior(&self, behavior: SimulatedBehavior) {
        *self.behavior.lock().unwrap_or_else(|p| p.into_inner()) = behavior;
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn behavior(&self) -> SimulatedBehavior {
        *self.behavior.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn respond(&self) -> Result<SimulatedBehavior, SupplierFault> {
        let behavior = self.behavior();
        if behavior == SimulatedBehavior::Stall {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(behavior)
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    async fn test_connection(&self) -> Result<Value, SupplierFault> {
        match self.respond().await? {
            SimulatedBehavior::Reject => Err(SupplierFault::Http {
                status: 503,
                body: "unavailable".into(),
            }),
            _ => Ok(json!({ "success": true, "message": format!("{} reachable", self.name) })),
        }
    }

    async fn fetch_balance(&self) -> Result<Value, SupplierFault> {
        self.respond().await?;
        Ok(json!({ "data": { "balance": self.balance, "currency": "USD" } }))
    }

    async fn submit(&self, request: &SubmitRequest) -> Result<Value, SupplierFault> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        match self.respond().await? {
            SimulatedBehavior::Reject => Err(SupplierFault::Rejected {
                code: "OUT_OF_STOCK".into(),
                message: format!("{} cannot serve {}", self.name, request.package_id),
            }),
            SimulatedBehavior::FailedStatus => Ok(json!({
                "status": "failed",
                "message": "upstream declined",
            })),
            _ => Ok(json!({
                "success": true,
                "data": {
                    "orderId": format!("{}-{}", self.name, request.order_id.simple()),
                    "status": "accepted",
                    "image": format!("https://cdn.topup.local/packages/{}.png", request.package_id),
                }
            })),
        }
    }

    async fn cancel(&self, external_order_id: &str) -> Result<Value, SupplierFault> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(json!({ "status": "cancelled", "reference": external_order_id }))
    }
}
