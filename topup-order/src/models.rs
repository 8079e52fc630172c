use crate::finance::{reconcile, FinancialRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use topup_catalog::{Package, ProviderType, RoutingPlan};
use topup_core::ErrorKind;
use topup_shared::Masked;
use uuid::Uuid;

pub const AUTO_FALLBACK_PREFIX: &str = "AUTO_FALLBACK:";

/// Operator-facing order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Approved,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Approved => "APPROVED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

/// Where the fulfillment attempt stands, independent of operator approval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchState {
    Created,
    Dispatching,
    Fulfilled,
    Failed,
}

impl DispatchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchState::Created => "CREATED",
            DispatchState::Dispatching => "DISPATCHING",
            DispatchState::Fulfilled => "FULFILLED",
            DispatchState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "result",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum AttemptOutcome {
    Success { external_order_id: Option<String> },
    Failed { kind: ErrorKind, message: String },
}

/// One fulfillment attempt against a provider or code group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    pub seq: u32,
    pub node: String,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCode {
    pub code_id: Uuid,
    pub pin: Option<String>,
    pub serial: Option<String>,
    pub cost: f64,
}

/// Settlement figures frozen on the order. Local figures are derived on read.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinancialSnapshot {
    pub sell_usd: Option<f64>,
    pub cost_usd: Option<f64>,
    pub profit_usd: Option<f64>,
    pub fx_rate_at_order: Option<f64>,
    pub fx_rate_at_approval: Option<f64>,
    pub fx_locked: bool,
}

impl FinancialSnapshot {
    pub fn restamp_cost(&mut self, cost_usd: f64) {
        self.cost_usd = Some(cost_usd);
        self.profit_usd = self.sell_usd.map(|sell| sell - cost_usd);
    }
}

/// Local-currency figures carried by records imported from the old ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LegacyFigures {
    pub sell_local: Option<f64>,
    pub cost_local: Option<f64>,
    pub profit_local: Option<f64>,
    pub cost_per_unit_usd: Option<f64>,
    pub fx_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub root_order_id: Uuid,
    pub package_id: String,
    pub quantity: u32,
    pub buyer_ref: Masked<String>,
    pub status: OrderStatus,
    pub dispatch_state: DispatchState,
    pub failure: Option<DispatchFailure>,
    pub provider_type: ProviderType,
    pub provider_id: Option<String>,
    pub external_order_id: Option<String>,
    pub codes: Vec<IssuedCode>,
    pub chain_path: Vec<ChainEntry>,
    pub rerouted: bool,
    pub annotations: Vec<String>,
    pub note: Option<String>,
    pub provider_message: Option<String>,
    pub pin_code: Option<String>,
    pub image_url: Option<String>,
    pub local_currency: String,
    pub financials: FinancialSnapshot,
    pub legacy: Option<LegacyFigures>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        package: &Package,
        quantity: u32,
        buyer_ref: String,
        plan: &RoutingPlan,
        local_currency: &str,
        fx_rate_at_order: Option<f64>,
    ) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let qty = f64::from(quantity);
        let sell_usd = package.unit_sell_usd * qty;
        let cost_usd = package.unit_cost_usd * qty;
        let provider_id = match plan {
            RoutingPlan::External { primary, .. } => Some(primary.clone()),
            _ => None,
        };
        Self {
            id,
            root_order_id: id,
            package_id: package.id.clone(),
            quantity,
            buyer_ref: Masked::new(buyer_ref),
            status: OrderStatus::Pending,
            dispatch_state: DispatchState::Created,
            failure: None,
            provider_type: plan.provider_type(),
            provider_id,
            external_order_id: None,
            codes: Vec::new(),
            chain_path: Vec::new(),
            rerouted: false,
            annotations: Vec::new(),
            note: None,
            provider_message: None,
            pin_code: None,
            image_url: None,
            local_currency: local_currency.to_string(),
            financials: FinancialSnapshot {
                sell_usd: Some(sell_usd),
                cost_usd: Some(cost_usd),
                profit_usd: Some(sell_usd - cost_usd),
                fx_rate_at_order,
                fx_rate_at_approval: None,
                fx_locked: false,
            },
            legacy: None,
            created_at: now,
            sent_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// A fresh pending order re-requesting what a rejected order asked for.
    /// The parent is left untouched.
    pub fn child_of(parent: &Order) -> Self {
        let now = Utc::now();
        let mut financials = parent.financials.clone();
        financials.fx_rate_at_approval = None;
        financials.fx_locked = false;
        Self {
            id: Uuid::new_v4(),
            root_order_id: parent.root_order_id,
            package_id: parent.package_id.clone(),
            quantity: parent.quantity,
            buyer_ref: parent.buyer_ref.clone(),
            status: OrderStatus::Pending,
            dispatch_state: DispatchState::Created,
            failure: None,
            provider_type: parent.provider_type,
            provider_id: None,
            external_order_id: None,
            codes: Vec::new(),
            chain_path: Vec::new(),
            rerouted: false,
            annotations: vec![format!("REDISPATCH_OF: {}", parent.id)],
            note: None,
            provider_message: None,
            pin_code: None,
            image_url: None,
            local_currency: parent.local_currency.clone(),
            financials,
            legacy: None,
            created_at: now,
            sent_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn is_child(&self) -> bool {
        self.root_order_id != self.id
    }

    /// Appends to the chain path; the first attempt stamps `sent_at`.
    pub fn record_attempt(&mut self, node: &str, outcome: AttemptOutcome) {
        let now = Utc::now();
        let seq = self.chain_path.last().map(|e| e.seq + 1).unwrap_or(1);
        self.chain_path.push(ChainEntry {
            seq,
            node: node.to_string(),
            outcome,
            at: now,
        });
        self.sent_at.get_or_insert(now);
        self.updated_at = now;
    }

    /// Starts a new dispatch round. `rerouted` describes the latest round
    /// only; earlier fallbacks stay in `annotations`.
    pub fn mark_dispatching(&mut self) {
        self.dispatch_state = DispatchState::Dispatching;
        self.failure = None;
        self.rerouted = false;
        self.updated_at = Utc::now();
    }

    pub fn mark_fulfilled(&mut self) {
        self.dispatch_state = DispatchState::Fulfilled;
        self.failure = None;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.dispatch_state = DispatchState::Failed;
        self.failure = Some(DispatchFailure {
            kind,
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }

    pub fn annotate_fallback(&mut self, primary: &str, fallback: &str) {
        self.rerouted = true;
        self.annotations
            .push(format!("{} {} -> {}", AUTO_FALLBACK_PREFIX, primary, fallback));
    }

    pub fn update_status(&mut self, new_status: OrderStatus) {
        let now = Utc::now();
        self.status = new_status;
        if new_status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn set_note(&mut self, note: Option<&str>) {
        if let Some(note) = note.map(str::trim).filter(|n| !n.is_empty()) {
            self.note = Some(note.to_string());
        }
    }

    /// Input for the reconciler: frozen USD figures plus any legacy locals.
    pub fn financial_record(&self) -> FinancialRecord {
        let legacy = self.legacy.clone().unwrap_or_default();
        FinancialRecord {
            sell_usd: self.financials.sell_usd,
            sell_local: legacy.sell_local,
            cost_usd: self.financials.cost_usd,
            cost_local: legacy.cost_local,
            cost_per_unit_usd: legacy.cost_per_unit_usd,
            profit_usd: self.financials.profit_usd,
            profit_local: legacy.profit_local,
            fx_rate_at_order: self.financials.fx_rate_at_order,
            fx_rate_at_approval: self.financials.fx_rate_at_approval,
            fx_rate: legacy.fx_rate,
            quantity: self.quantity,
            provider_type: self.provider_type,
        }
    }

    pub fn view(&self) -> OrderView {
        OrderView {
            settlement: reconcile(&self.financial_record()),
            order: self.clone(),
        }
    }
}

/// Order as returned to callers, with settlement figures reconciled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    #[serde(flatten)]
    pub order: Order,
    pub settlement: FinancialRecord,
}
