use crate::ErrorKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

const EXTERNAL_ID_KEYS: &[&str] = &[
    "externalOrderId",
    "external_id",
    "orderId",
    "order_id",
    "id",
    "reference",
];
const STATUS_KEYS: &[&str] = &["status", "state"];
const FAILED_STATUSES: &[&str] = &["failed", "error", "rejected"];
const MESSAGE_KEYS: &[&str] = &["message", "error", "msg", "reason"];
const BALANCE_KEYS: &[&str] = &["balance", "amount", "credit"];
const CURRENCY_KEYS: &[&str] = &["currency", "currency_code"];
const PIN_KEYS: &[&str] = &["pin", "pinCode", "pin_code", "code"];
const IMAGE_KEYS: &[&str] = &["imageUrl", "image", "logoUrl", "iconUrl", "icon"];

/// Failure reported by a supplier adapter before normalization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupplierFault {
    #[error("supplier did not answer in time")]
    Timeout,
    #[error("supplier returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("supplier rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub order_id: Uuid,
    pub package_id: String,
    pub quantity: u32,
    pub buyer_ref: String,
}

/// Uniform contract every external supplier integration implements.
///
/// Adapters return the supplier's raw payload; the gateway is the only place
/// that interprets it.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn test_connection(&self) -> Result<Value, SupplierFault>;

    async fn fetch_balance(&self) -> Result<Value, SupplierFault>;

    async fn submit(&self, request: &SubmitRequest) -> Result<Value, SupplierFault>;

    async fn cancel(&self, external_order_id: &str) -> Result<Value, SupplierFault>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub amount: f64,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub external_order_id: String,
    pub message: Option<String>,
    pub pin: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub ok: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::ProviderRejected,
            message: message.into(),
        }
    }

    fn timeout(provider_id: &str, limit: Duration) -> Self {
        Self {
            kind: ErrorKind::ProviderTimeout,
            message: format!("{} did not answer within {}ms", provider_id, limit.as_millis()),
        }
    }
}

impl From<SupplierFault> for GatewayError {
    fn from(fault: SupplierFault) -> Self {
        match fault {
            SupplierFault::Timeout => Self {
                kind: ErrorKind::ProviderTimeout,
                message: fault.to_string(),
            },
            other => Self::rejected(other.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Registry of adapters keyed by provider id.
///
/// Every call is bounded by `call_timeout`; a timeout is reported as
/// `PROVIDER_TIMEOUT` and every other fault as `PROVIDER_REJECTED`.
pub struct ProviderGateway {
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
    call_timeout: Duration,
}

impl ProviderGateway {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    pub fn with_adapter(mut self, provider_id: &str, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters
            .get_mut()
            .insert(provider_id.to_string(), adapter);
        self
    }

    pub async fn register(&self, provider_id: &str, adapter: Arc<dyn ProviderAdapter>) {
        let mut adapters = self.adapters.write().await;
        adapters.insert(provider_id.to_string(), adapter);
        tracing::info!("Registered provider adapter {}", provider_id);
    }

    pub async fn contains(&self, provider_id: &str) -> bool {
        self.adapters.read().await.contains_key(provider_id)
    }

    pub async fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    // The registry lock is released before the adapter is awaited.
    async fn adapter(&self, provider_id: &str) -> GatewayResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .read()
            .await
            .get(provider_id)
            .cloned()
            .ok_or_else(|| GatewayError::rejected(format!("unknown provider {}", provider_id)))
    }

    async fn bounded<F>(&self, provider_id: &str, call: F) -> GatewayResult<Value>
    where
        F: std::future::Future<Output = Result<Value, SupplierFault>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(fault)) => {
                tracing::warn!("Provider {} fault: {}", provider_id, fault);
                Err(fault.into())
            }
            Err(_) => {
                tracing::warn!("Provider {} timed out after {:?}", provider_id, self.call_timeout);
                Err(GatewayError::timeout(provider_id, self.call_timeout))
            }
        }
    }

    pub async fn submit(
        &self,
        provider_id: &str,
        request: &SubmitRequest,
    ) -> GatewayResult<SubmitReceipt> {
        let adapter = self.adapter(provider_id).await?;
        tracing::debug!(
            "Submitting order {} (package {}, qty {}) to {}",
            request.order_id,
            request.package_id,
            request.quantity,
            provider_id
        );
        let payload = self.bounded(provider_id, adapter.submit(request)).await?;
        normalize_submit(&payload)
    }

    pub async fn cancel(&self, provider_id: &str, external_order_id: &str) -> GatewayResult<()> {
        let adapter = self.adapter(provider_id).await?;
        let payload = self
            .bounded(provider_id, adapter.cancel(external_order_id))
            .await?;
        if let Some(reason) = rejection(&payload) {
            return Err(GatewayError::rejected(reason));
        }
        Ok(())
    }

    pub async fn fetch_balance(&self, provider_id: &str) -> GatewayResult<Balance> {
        let adapter = self.adapter(provider_id).await?;
        let payload = self.bounded(provider_id, adapter.fetch_balance()).await?;
        normalize_balance(&payload)
    }

    pub async fn test_connection(&self, provider_id: &str) -> GatewayResult<ConnectionReport> {
        let adapter = self.adapter(provider_id).await?;
        let payload = self.bounded(provider_id, adapter.test_connection()).await?;
        Ok(ConnectionReport {
            ok: rejection(&payload).is_none(),
            message: pick_str(&payload, MESSAGE_KEYS),
        })
    }
}

/// Looks a key up on the payload itself, then inside a nested `data` object.
fn lookup<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let scopes = [Some(payload), payload.get("data")];
    for scope in scopes.into_iter().flatten() {
        for key in keys {
            match scope.get(*key) {
                None | Some(Value::Null) => continue,
                Some(v) => return Some(v),
            }
        }
    }
    None
}

fn pick_str(payload: &Value, keys: &[&str]) -> Option<String> {
    match lookup(payload, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pick_f64(payload: &Value, keys: &[&str]) -> Option<f64> {
    let n = match lookup(payload, keys)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Returns the supplier's reason when the payload describes a failure.
fn rejection(payload: &Value) -> Option<String> {
    let failed_flag = matches!(lookup(payload, &["success"]), Some(Value::Bool(false)));
    let failed_status = pick_str(payload, STATUS_KEYS)
        .map(|s| FAILED_STATUSES.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false);
    if failed_flag || failed_status {
        Some(pick_str(payload, MESSAGE_KEYS).unwrap_or_else(|| "supplier reported failure".into()))
    } else {
        None
    }
}

pub fn normalize_submit(payload: &Value) -> GatewayResult<SubmitReceipt> {
    if let Some(reason) = rejection(payload) {
        return Err(GatewayError::rejected(reason));
    }
    let external_order_id = pick_str(payload, EXTERNAL_ID_KEYS)
        .ok_or_else(|| GatewayError::rejected("response carried no external order id"))?;
    Ok(SubmitReceipt {
        external_order_id,
        message: pick_str(payload, MESSAGE_KEYS),
        pin: pick_str(payload, PIN_KEYS),
        image_url: normalize_image(payload),
    })
}

pub fn normalize_balance(payload: &Value) -> GatewayResult<Balance> {
    if let Some(reason) = rejection(payload) {
        return Err(GatewayError::rejected(reason));
    }
    let amount = pick_f64(payload, BALANCE_KEYS)
        .ok_or_else(|| GatewayError::rejected("response carried no balance"))?;
    Ok(Balance {
        amount,
        currency: pick_str(payload, CURRENCY_KEYS).map(|c| c.to_uppercase()),
    })
}

pub fn normalize_image(payload: &Value) -> Option<String> {
    pick_str(payload, IMAGE_KEYS)
}
