use crate::finance::{reconcile, ProfitSummary};
use crate::models::{DispatchFailure, DispatchState, Order, OrderStatus, OrderView};
use crate::orchestrator::FulfillmentOrchestrator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use topup_catalog::{
    CodeError, PackageCatalog, PackageError, ProviderType, RoutingError, RoutingPlan, RoutingStore,
};
use topup_core::currency::FxTable;
use topup_core::ErrorKind;
use topup_shared::{OrderChange, OrderEvent};
use topup_store::EventHub;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct TenantContext {
    pub id: String,
    pub local_currency: String,
}

/// Result of an operator action on one order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "outcome",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ActionOutcome {
    Applied,
    /// The order was already in the requested state.
    Unchanged,
    Skipped { kind: ErrorKind },
    Dispatched {
        order_id: Uuid,
        state: DispatchState,
        failure: Option<DispatchFailure>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Quantity must be at least 1, got {0}")]
    InvalidQuantity(u32),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Code(#[from] CodeError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("Order processing failed: {0}")]
    Internal(String),
}

impl OrderError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            OrderError::Routing(e) => Some(e.kind()),
            OrderError::Code(e) => e.kind(),
            OrderError::Internal(_) => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub mode: Option<ProviderType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

impl OrderFilter {
    fn matches(&self, order: &Order) -> bool {
        self.status.map_or(true, |s| order.status == s)
            && self.mode.map_or(true, |m| order.provider_type == m)
            && self.from.map_or(true, |from| order.created_at >= from)
            && self.to.map_or(true, |to| order.created_at <= to)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPage {
    pub items: Vec<OrderView>,
    pub next_cursor: Option<String>,
}

type SortKey = (i64, Uuid);

fn sort_key(order: &Order) -> SortKey {
    (order.created_at.timestamp_millis(), order.id)
}

fn encode_cursor(order: &Order) -> String {
    let (millis, id) = sort_key(order);
    format!("{}_{}", millis, id)
}

fn decode_cursor(raw: &str) -> Result<SortKey, OrderError> {
    let invalid = || OrderError::InvalidCursor(raw.to_string());
    let (millis, id) = raw.split_once('_').ok_or_else(invalid)?;
    let millis = millis.parse::<i64>().map_err(|_| invalid())?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;
    Ok((millis, id))
}

/// Per-order mutexes plus the latest committed copy of every order for reads.
struct OrderBook {
    slots: RwLock<HashMap<Uuid, Arc<Mutex<Order>>>>,
    snapshots: RwLock<HashMap<Uuid, Order>>,
}

impl OrderBook {
    fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, slot: Arc<Mutex<Order>>, order: &Order) {
        self.slots
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(order.id, slot);
        self.store(order);
    }

    fn slot(&self, id: Uuid) -> Option<Arc<Mutex<Order>>> {
        self.slots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    fn store(&self, order: &Order) {
        self.snapshots
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(order.id, order.clone());
    }

    fn snapshot(&self, id: Uuid) -> Option<Order> {
        self.snapshots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    fn all(&self) -> Vec<Order> {
        self.snapshots
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

/// Owns order state and serializes every mutation of an order behind that
/// order's mutex. Mutations run in spawned tasks so a dropped caller cannot
/// interrupt them halfway.
#[derive(Clone)]
pub struct OrderManager {
    tenant: Arc<TenantContext>,
    book: Arc<OrderBook>,
    routing: Arc<RoutingStore>,
    catalog: Arc<PackageCatalog>,
    fx: Arc<dyn FxTable>,
    orchestrator: Arc<FulfillmentOrchestrator>,
    events: Arc<EventHub>,
}

impl OrderManager {
    pub fn new(
        tenant: TenantContext,
        routing: Arc<RoutingStore>,
        catalog: Arc<PackageCatalog>,
        fx: Arc<dyn FxTable>,
        orchestrator: Arc<FulfillmentOrchestrator>,
        events: Arc<EventHub>,
    ) -> Self {
        Self {
            tenant: Arc::new(tenant),
            book: Arc::new(OrderBook::new()),
            routing,
            catalog,
            fx,
            orchestrator,
            events,
        }
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn routing(&self) -> &Arc<RoutingStore> {
        &self.routing
    }

    pub fn catalog(&self) -> &Arc<PackageCatalog> {
        &self.catalog
    }

    pub fn orchestrator(&self) -> &Arc<FulfillmentOrchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Creates an order, freezes its routing plan and dispatches it.
    pub async fn create_order(
        &self,
        package_id: &str,
        quantity: u32,
        buyer_ref: String,
    ) -> Result<Order, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }
        let package = self.catalog.get(package_id)?;
        let plan = self.routing.resolve(package_id);
        let rate = self.fx.rate(&self.tenant.local_currency);
        let order = Order::new(
            &package,
            quantity,
            buyer_ref,
            &plan,
            &self.tenant.local_currency,
            rate,
        );
        tracing::info!(
            "Creating order {} for {} x{} via {} (buyer {})",
            order.id,
            package_id,
            quantity,
            plan.provider_type().as_str(),
            order.buyer_ref.hint()
        );

        let guard = self.admit(order).await;
        let this = self.clone();
        tokio::spawn(async move {
            let mut order = guard;
            this.run_dispatch(&mut order, &plan, OrderChange::Dispatched)
                .await;
            order.clone()
        })
        .await
        .map_err(|e| OrderError::Internal(format!("dispatch task aborted: {}", e)))
    }

    /// Stores an order as-is, e.g. a record carried over from the old ledger.
    pub async fn import_order(&self, order: Order) -> Order {
        let guard = self.admit(order).await;
        guard.clone()
    }

    pub fn get_order(&self, id: Uuid) -> Result<Order, OrderError> {
        self.book.snapshot(id).ok_or(OrderError::NotFound(id))
    }

    /// Newest first, `id` descending on equal timestamps.
    pub fn list_orders(&self, filter: &OrderFilter) -> Result<OrderPage, OrderError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let after = filter.cursor.as_deref().map(decode_cursor).transpose()?;

        let mut orders: Vec<Order> = self
            .book
            .all()
            .into_iter()
            .filter(|o| filter.matches(o))
            .filter(|o| after.map_or(true, |cursor| sort_key(o) < cursor))
            .collect();
        orders.sort_by_key(|o| std::cmp::Reverse(sort_key(o)));

        let has_more = orders.len() > limit;
        orders.truncate(limit);
        let next_cursor = if has_more {
            orders.last().map(encode_cursor)
        } else {
            None
        };
        Ok(OrderPage {
            items: orders.iter().map(Order::view).collect(),
            next_cursor,
        })
    }

    pub fn count_pending(&self, kind: Option<ProviderType>) -> usize {
        self.book
            .all()
            .iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .filter(|o| kind.map_or(true, |k| o.provider_type == k))
            .count()
    }

    /// Settlement totals over approved orders created in the window.
    pub fn profit_report(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> ProfitSummary {
        let filter = OrderFilter {
            status: Some(OrderStatus::Approved),
            from,
            to,
            ..Default::default()
        };
        let records: Vec<_> = self
            .book
            .all()
            .iter()
            .filter(|o| filter.matches(o))
            .map(|o| reconcile(&o.financial_record()))
            .collect();
        ProfitSummary::from_records(&records)
    }

    pub async fn approve(&self, id: Uuid, note: Option<String>) -> Result<ActionOutcome, OrderError> {
        self.spawn_locked(id, move |this, mut order| async move {
            this.approve_locked(&mut order, note.as_deref()).await
        })
        .await
    }

    pub async fn reject(&self, id: Uuid, note: Option<String>) -> Result<ActionOutcome, OrderError> {
        self.spawn_locked(id, move |this, mut order| async move {
            this.reject_locked(&mut order, note.as_deref()).await
        })
        .await
    }

    pub async fn set_manual(&self, id: Uuid, note: Option<String>) -> Result<ActionOutcome, OrderError> {
        self.spawn_locked(id, move |this, mut order| async move {
            this.set_manual_locked(&mut order, note.as_deref()).await
        })
        .await
    }

    /// Operator override: sends the order to `provider_id`.
    pub async fn dispatch(
        &self,
        id: Uuid,
        provider_id: String,
        note: Option<String>,
    ) -> Result<ActionOutcome, OrderError> {
        self.spawn_locked(id, move |this, mut order| async move {
            this.dispatch_locked(&mut order, &provider_id, note.as_deref())
                .await
        })
        .await
    }

    async fn admit(&self, order: Order) -> OwnedMutexGuard<Order> {
        let slot = Arc::new(Mutex::new(order));
        let guard = slot.clone().lock_owned().await;
        self.book.insert(slot, &guard);
        self.publish(&guard, OrderChange::Created);
        guard
    }

    async fn spawn_locked<F, Fut, T>(&self, id: Uuid, work: F) -> Result<T, OrderError>
    where
        F: FnOnce(OrderManager, OwnedMutexGuard<Order>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, OrderError>> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self.book.slot(id).ok_or(OrderError::NotFound(id))?;
        let this = self.clone();
        tokio::spawn(async move {
            let guard = slot.lock_owned().await;
            work(this, guard).await
        })
        .await
        .map_err(|e| OrderError::Internal(format!("order task aborted: {}", e)))?
    }

    async fn approve_locked(&self, order: &mut Order, note: Option<&str>) -> Result<ActionOutcome, OrderError> {
        match order.status {
            OrderStatus::Approved => return Ok(ActionOutcome::Unchanged),
            OrderStatus::Rejected => {
                return Ok(ActionOutcome::Skipped {
                    kind: ErrorKind::AlreadyTerminal,
                })
            }
            OrderStatus::Pending => {}
        }

        self.orchestrator.commit_codes(order).await?;
        if !order.financials.fx_locked {
            let rate = self
                .fx
                .rate(&order.local_currency)
                .or(order.financials.fx_rate_at_order);
            order.financials.fx_rate_at_approval = rate;
            order.financials.fx_locked = true;
        }
        order.set_note(note);
        order.update_status(OrderStatus::Approved);
        self.commit(order, OrderChange::Approved);
        tracing::info!("Order {} approved", order.id);
        Ok(ActionOutcome::Applied)
    }

    async fn reject_locked(&self, order: &mut Order, note: Option<&str>) -> Result<ActionOutcome, OrderError> {
        match order.status {
            OrderStatus::Rejected => return Ok(ActionOutcome::Unchanged),
            OrderStatus::Approved => {
                return Ok(ActionOutcome::Skipped {
                    kind: ErrorKind::AlreadyTerminal,
                })
            }
            OrderStatus::Pending => {}
        }

        self.orchestrator.unwind(order).await;
        order.set_note(note);
        order.update_status(OrderStatus::Rejected);
        self.commit(order, OrderChange::Rejected);
        tracing::info!("Order {} rejected", order.id);
        Ok(ActionOutcome::Applied)
    }

    async fn set_manual_locked(&self, order: &mut Order, note: Option<&str>) -> Result<ActionOutcome, OrderError> {
        if order.status.is_terminal() {
            return Ok(ActionOutcome::Skipped {
                kind: ErrorKind::AlreadyTerminal,
            });
        }

        self.orchestrator.unwind(order).await;
        self.restore_package_cost(order);
        order.provider_type = ProviderType::Manual;
        order.provider_id = None;
        order.provider_message = None;
        order.rerouted = false;
        order.mark_fulfilled();
        order.set_note(note);
        self.commit(order, OrderChange::SwitchedToManual);
        tracing::info!("Order {} switched to manual", order.id);
        Ok(ActionOutcome::Applied)
    }

    async fn dispatch_locked(
        &self,
        order: &mut Order,
        provider_id: &str,
        note: Option<&str>,
    ) -> Result<ActionOutcome, OrderError> {
        if order.status == OrderStatus::Approved {
            return Ok(ActionOutcome::Skipped {
                kind: ErrorKind::AlreadyTerminal,
            });
        }
        let plan = self.override_plan(&order.package_id, provider_id)?;

        if order.status == OrderStatus::Pending {
            self.orchestrator.unwind(order).await;
            self.restore_package_cost(order);
            order.set_note(note);
            self.run_dispatch(order, &plan, OrderChange::Redispatched)
                .await;
            return Ok(ActionOutcome::Dispatched {
                order_id: order.id,
                state: order.dispatch_state,
                failure: order.failure.clone(),
            });
        }

        let mut child = Order::child_of(order);
        self.restore_package_cost(&mut child);
        child.set_note(note);
        tracing::info!(
            "Re-dispatching rejected order {} as {} via {}",
            order.id,
            child.id,
            provider_id
        );
        let mut child = self.admit(child).await;
        self.run_dispatch(&mut child, &plan, OrderChange::Dispatched)
            .await;
        Ok(ActionOutcome::Dispatched {
            order_id: child.id,
            state: child.dispatch_state,
            failure: child.failure.clone(),
        })
    }

    /// The override provider, backed by the package's stored fallback when
    /// that is a different provider.
    fn override_plan(&self, package_id: &str, provider_id: &str) -> Result<RoutingPlan, RoutingError> {
        let fallback = match self.routing.resolve(package_id) {
            RoutingPlan::External {
                fallback: Some(fallback),
                ..
            } if fallback != provider_id.trim() => Some(fallback),
            _ => None,
        };
        RoutingPlan::external(provider_id, fallback.as_deref())
    }

    fn restore_package_cost(&self, order: &mut Order) {
        if order.provider_type != ProviderType::InternalCodes {
            return;
        }
        match self.catalog.get(&order.package_id) {
            Ok(package) => order
                .financials
                .restamp_cost(package.unit_cost_usd * f64::from(order.quantity)),
            Err(e) => tracing::warn!("Order {}: cost not restored: {}", order.id, e),
        }
    }

    async fn run_dispatch(&self, order: &mut Order, plan: &RoutingPlan, change: OrderChange) {
        order.mark_dispatching();
        self.book.store(order);
        self.orchestrator.execute(order, plan).await;
        self.commit(order, change);
    }

    fn commit(&self, order: &Order, change: OrderChange) {
        self.book.store(order);
        self.publish(order, change);
    }

    fn publish(&self, order: &Order, change: OrderChange) {
        self.events.publish(OrderEvent {
            tenant_id: self.tenant.id.clone(),
            order_id: order.id,
            root_order_id: order.root_order_id,
            change,
            status: order.status.as_str().to_string(),
            dispatch_state: order.dispatch_state.as_str().to_string(),
            provider_type: order.provider_type.as_str().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LegacyFigures;
    use std::time::Duration;
    use topup_catalog::{CodeAllocator, CodeError, CodeStatus, InMemoryCodeStore, Package};
    use topup_core::currency::CurrencyTable;
    use topup_core::simulated::{SimulatedBehavior, SimulatedProvider};
    use topup_core::supplier::ProviderGateway;

    struct Harness {
        manager: OrderManager,
        fx: Arc<CurrencyTable>,
        p1: Arc<SimulatedProvider>,
        p2: Arc<SimulatedProvider>,
    }

    fn harness() -> Harness {
        harness_with(SimulatedProvider::new("p1", SimulatedBehavior::Accept))
    }

    fn harness_with(p1: SimulatedProvider) -> Harness {
        let p1 = Arc::new(p1);
        let p2 = Arc::new(SimulatedProvider::new("p2", SimulatedBehavior::Accept));
        let gateway = ProviderGateway::new(Duration::from_millis(50))
            .with_adapter("p1", p1.clone())
            .with_adapter("p2", p2.clone());
        let allocator = CodeAllocator::new(Arc::new(InMemoryCodeStore::new()), 4);
        let orchestrator = FulfillmentOrchestrator::new(Arc::new(gateway), Arc::new(allocator));
        let catalog = PackageCatalog::with_packages([Package {
            id: "pkg".into(),
            name: "Pkg".into(),
            unit_sell_usd: 2.0,
            unit_cost_usd: 1.5,
            is_active: true,
        }]);
        let fx = Arc::new(CurrencyTable::with_rates([("TRY", 30.0)]).unwrap());
        let manager = OrderManager::new(
            TenantContext {
                id: "acme".into(),
                local_currency: "TRY".into(),
            },
            Arc::new(RoutingStore::new()),
            Arc::new(catalog),
            fx.clone(),
            Arc::new(orchestrator),
            Arc::new(EventHub::new(64)),
        );
        Harness { manager, fx, p1, p2 }
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let h = harness();
        assert!(matches!(
            h.manager.create_order("pkg", 0, "b".into()).await,
            Err(OrderError::InvalidQuantity(0))
        ));
        assert!(matches!(
            h.manager.create_order("nope", 1, "b".into()).await,
            Err(OrderError::Package(PackageError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_create_publishes_created_and_dispatched() {
        let h = harness();
        let mut rx = h.manager.events().subscribe("acme");
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        assert_eq!(order.dispatch_state, DispatchState::Fulfilled);
        assert_eq!(order.financials.fx_rate_at_order, Some(30.0));

        let created = rx.recv().await.unwrap();
        assert_eq!(created.change, OrderChange::Created);
        let dispatched = rx.recv().await.unwrap();
        assert_eq!(dispatched.change, OrderChange::Dispatched);
        assert_eq!(dispatched.dispatch_state, "FULFILLED");
    }

    #[tokio::test]
    async fn test_approval_locks_fx_once() {
        let h = harness();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        h.fx.upsert("TRY", 32.0).unwrap();

        assert_eq!(h.manager.approve(order.id, None).await.unwrap(), ActionOutcome::Applied);
        h.fx.upsert("TRY", 40.0).unwrap();
        assert_eq!(h.manager.approve(order.id, None).await.unwrap(), ActionOutcome::Unchanged);

        let stored = h.manager.get_order(order.id).unwrap();
        assert_eq!(stored.financials.fx_rate_at_approval, Some(32.0));
        assert_eq!(stored.financials.fx_rate_at_order, Some(30.0));
        assert!(stored.financials.fx_locked);
        assert!(stored.completed_at.is_some());

        assert_eq!(
            h.manager.reject(order.id, None).await.unwrap(),
            ActionOutcome::Skipped {
                kind: ErrorKind::AlreadyTerminal
            }
        );
    }

    #[tokio::test]
    async fn test_reject_releases_codes_and_approve_commits_them() {
        let h = harness();
        h.manager.routing().set_code_group("pkg", "g1").unwrap();
        let alloc = h.manager.orchestrator().allocator().clone();
        alloc.create_group("g1", "Group one").await.unwrap();
        alloc.add_codes("g1", "A;1\nB;2", Some(1.0)).await.unwrap();

        let first = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        let second = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        assert_eq!(alloc.group_stats("g1").await.unwrap().reserved, 2);

        h.manager.reject(first.id, Some("buyer cancelled".into())).await.unwrap();
        h.manager.approve(second.id, None).await.unwrap();

        let stats = alloc.group_stats("g1").await.unwrap();
        assert_eq!((stats.available, stats.used, stats.reserved), (1, 1, 0));
        let codes = alloc.list_group("g1").await.unwrap();
        let used = codes.iter().find(|c| c.status == CodeStatus::Used).unwrap();
        assert_eq!(used.order_id, Some(second.id));
        assert_eq!(
            h.manager.get_order(first.id).unwrap().note.as_deref(),
            Some("buyer cancelled")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_code_two_concurrent_orders() {
        let h = harness();
        h.manager.routing().set_code_group("pkg", "g1").unwrap();
        let alloc = h.manager.orchestrator().allocator().clone();
        alloc.create_group("g1", "Group one").await.unwrap();
        alloc.add_codes("g1", "ONLY", Some(1.0)).await.unwrap();

        let (a, b) = tokio::join!(
            h.manager.create_order("pkg", 1, "a".into()),
            h.manager.create_order("pkg", 1, "b".into())
        );
        let states = [a.unwrap(), b.unwrap()];
        let fulfilled = states
            .iter()
            .filter(|o| o.dispatch_state == DispatchState::Fulfilled)
            .count();
        let exhausted = states
            .iter()
            .filter(|o| o.failure.as_ref().map(|f| f.kind) == Some(ErrorKind::CodesExhausted))
            .count();
        assert_eq!((fulfilled, exhausted), (1, 1));
    }

    #[tokio::test]
    async fn test_set_manual_cancels_external_and_clears_linkage() {
        let h = harness();
        h.manager.routing().set_providers("pkg", "p1", None).unwrap();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        assert!(order.external_order_id.is_some());

        h.manager.set_manual(order.id, None).await.unwrap();
        let stored = h.manager.get_order(order.id).unwrap();
        assert_eq!(stored.provider_type, ProviderType::Manual);
        assert_eq!(stored.provider_id, None);
        assert_eq!(stored.external_order_id, None);
        assert_eq!(stored.dispatch_state, DispatchState::Fulfilled);
        assert_eq!(h.p1.cancel_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_override_uses_stored_fallback() {
        let h = harness();
        h.manager.routing().set_providers("pkg", "p1", Some("p2")).unwrap();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        h.p1.set_behavior(SimulatedBehavior::Reject);

        let outcome = h.manager.dispatch(order.id, "p1".into(), None).await.unwrap();
        match outcome {
            ActionOutcome::Dispatched { order_id, state, .. } => {
                assert_eq!(order_id, order.id);
                assert_eq!(state, DispatchState::Fulfilled);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let stored = h.manager.get_order(order.id).unwrap();
        assert_eq!(stored.provider_id.as_deref(), Some("p2"));
        assert!(stored.rerouted);
        // first dispatch, then p1 failure and p2 success
        assert_eq!(stored.chain_path.len(), 3);
        assert_eq!(h.p1.cancel_count(), 1);
        assert_eq!(h.p2.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_redispatch_clears_stale_reroute_flag() {
        let h = harness();
        h.manager.routing().set_providers("pkg", "p1", Some("p2")).unwrap();
        h.p1.set_behavior(SimulatedBehavior::Reject);
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        assert!(order.rerouted);
        assert_eq!(order.provider_id.as_deref(), Some("p2"));

        h.p1.set_behavior(SimulatedBehavior::Accept);
        h.manager.dispatch(order.id, "p1".into(), None).await.unwrap();

        let stored = h.manager.get_order(order.id).unwrap();
        assert_eq!(stored.provider_id.as_deref(), Some("p1"));
        assert_eq!(stored.dispatch_state, DispatchState::Fulfilled);
        assert!(!stored.rerouted);
        assert!(stored
            .annotations
            .contains(&"AUTO_FALLBACK: p1 -> p2".to_string()));
    }

    #[tokio::test]
    async fn test_approve_commits_all_codes_or_none() {
        let h = harness();
        h.manager.routing().set_code_group("pkg", "g1").unwrap();
        let alloc = h.manager.orchestrator().allocator().clone();
        alloc.create_group("g1", "Group one").await.unwrap();
        alloc.add_codes("g1", "A;1\nB;2", Some(1.0)).await.unwrap();

        let order = h.manager.create_order("pkg", 2, "b".into()).await.unwrap();
        assert_eq!(order.codes.len(), 2);
        alloc.disable(order.codes[1].code_id).await.unwrap();

        for _ in 0..2 {
            let err = h.manager.approve(order.id, None).await.unwrap_err();
            assert!(matches!(
                err,
                OrderError::Code(CodeError::InvalidTransition {
                    from: CodeStatus::Disabled,
                    ..
                })
            ));
        }
        let first = alloc.list_group("g1").await.unwrap();
        let first = first.iter().find(|c| c.id == order.codes[0].code_id).unwrap();
        assert_eq!(first.status, CodeStatus::Reserved);
        assert_eq!(h.manager.get_order(order.id).unwrap().status, OrderStatus::Pending);

        h.manager.reject(order.id, None).await.unwrap();
        let stats = alloc.group_stats("g1").await.unwrap();
        assert_eq!((stats.available, stats.reserved, stats.used, stats.disabled), (1, 0, 0, 1));
    }

    #[tokio::test]
    async fn test_approve_accepts_codes_already_used_by_the_order() {
        let h = harness();
        h.manager.routing().set_code_group("pkg", "g1").unwrap();
        let alloc = h.manager.orchestrator().allocator().clone();
        alloc.create_group("g1", "Group one").await.unwrap();
        alloc.add_codes("g1", "A;1\nB;2", Some(1.0)).await.unwrap();

        let order = h.manager.create_order("pkg", 2, "b".into()).await.unwrap();
        alloc.commit(order.codes[0].code_id, order.id).await.unwrap();

        assert_eq!(h.manager.approve(order.id, None).await.unwrap(), ActionOutcome::Applied);
        assert_eq!(alloc.group_stats("g1").await.unwrap().used, 2);
    }

    #[tokio::test]
    async fn test_missing_code_group_fails_as_invalid_routing() {
        let h = harness();
        h.manager.routing().set_code_group("pkg", "ghost").unwrap();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        assert_eq!(order.dispatch_state, DispatchState::Failed);
        assert_eq!(order.failure.map(|f| f.kind), Some(ErrorKind::InvalidRouting));
    }

    #[tokio::test]
    async fn test_dispatch_survives_a_cancelled_caller() {
        let h = harness_with(
            SimulatedProvider::new("p1", SimulatedBehavior::Accept).with_latency(Duration::from_millis(30)),
        );
        h.manager.routing().set_providers("pkg", "p1", None).unwrap();
        let mut rx = h.manager.events().subscribe("acme");

        let manager = h.manager.clone();
        let caller = tokio::spawn(async move { manager.create_order("pkg", 1, "b".into()).await });
        let created = rx.recv().await.unwrap();
        assert_eq!(created.change, OrderChange::Created);
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        let dispatched = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dispatched.change, OrderChange::Dispatched);
        assert_eq!(dispatched.order_id, created.order_id);

        let stored = h.manager.get_order(created.order_id).unwrap();
        assert_eq!(stored.dispatch_state, DispatchState::Fulfilled);
        assert_eq!(stored.chain_path.len(), 1);
        assert!(stored.external_order_id.is_some());
        assert_eq!(h.p1.submit_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_rejected_creates_child() {
        let h = harness();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        h.manager.reject(order.id, None).await.unwrap();

        let outcome = h.manager.dispatch(order.id, "p2".into(), None).await.unwrap();
        let child_id = match outcome {
            ActionOutcome::Dispatched { order_id, .. } => order_id,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_ne!(child_id, order.id);

        let child = h.manager.get_order(child_id).unwrap();
        assert_eq!(child.root_order_id, order.id);
        assert_eq!(child.provider_id.as_deref(), Some("p2"));
        assert_eq!(child.status, OrderStatus::Pending);

        let parent = h.manager.get_order(order.id).unwrap();
        assert_eq!(parent.status, OrderStatus::Rejected);
        assert!(parent.chain_path.is_empty());

        h.manager.approve(child_id, None).await.unwrap();
        assert_eq!(
            h.manager.dispatch(child_id, "p1".into(), None).await.unwrap(),
            ActionOutcome::Skipped {
                kind: ErrorKind::AlreadyTerminal
            }
        );
    }

    #[tokio::test]
    async fn test_dispatch_with_blank_provider_is_invalid_routing() {
        let h = harness();
        let order = h.manager.create_order("pkg", 1, "b".into()).await.unwrap();
        let err = h.manager.dispatch(order.id, " ".into(), None).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::InvalidRouting));
    }

    #[tokio::test]
    async fn test_listing_pages_with_cursor_and_counts() {
        let h = harness();
        h.manager.routing().set_providers("pkg", "p1", None).unwrap();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(h.manager.create_order("pkg", 1, "b".into()).await.unwrap().id);
        }
        h.manager.approve(ids[0], None).await.unwrap();

        let first = h
            .manager
            .list_orders(&OrderFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next_cursor.clone().unwrap();

        let second = h
            .manager
            .list_orders(&OrderFilter {
                limit: Some(10),
                cursor: Some(cursor),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second.items.len(), 3);
        assert!(second.next_cursor.is_none());

        let mut seen: Vec<Uuid> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|v| v.order.id)
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        assert_eq!(h.manager.count_pending(None), 4);
        assert_eq!(h.manager.count_pending(Some(ProviderType::External)), 4);
        assert_eq!(h.manager.count_pending(Some(ProviderType::Manual)), 0);

        assert!(matches!(
            h.manager.list_orders(&OrderFilter {
                cursor: Some("garbage".into()),
                ..Default::default()
            }),
            Err(OrderError::InvalidCursor(_))
        ));
    }

    #[tokio::test]
    async fn test_profit_report_repairs_legacy_records() {
        let h = harness();
        let order = h.manager.create_order("pkg", 2, "b".into()).await.unwrap();
        h.manager.approve(order.id, None).await.unwrap();

        let mut legacy = Order::new(
            &h.manager.catalog().get("pkg").unwrap(),
            2,
            "old".into(),
            &RoutingPlan::Manual,
            "TRY",
            Some(35.0),
        );
        legacy.financials.cost_usd = None;
        legacy.financials.profit_usd = None;
        legacy.legacy = Some(LegacyFigures {
            cost_per_unit_usd: Some(25.0),
            ..Default::default()
        });
        legacy.update_status(OrderStatus::Approved);
        h.manager.import_order(legacy).await;

        let report = h.manager.profit_report(None, None);
        assert_eq!(report.orders, 2);
        assert_eq!(report.incomplete, 0);
        let expected_cost = 3.0 + 25.0 / 35.0 * 2.0;
        assert!((report.cost_usd - expected_cost).abs() < 1e-9);
    }
}
