use crate::worker::BalanceBoard;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use topup_catalog::{CodeAllocator, CodeError, CodeStore, Package, PackageCatalog, RoutingPlan, RoutingStore};
use topup_core::currency::CurrencyTable;
use topup_core::simulated::SimulatedProvider;
use topup_core::supplier::ProviderGateway;
use topup_order::{BulkExecutor, FulfillmentOrchestrator, OrderManager, TenantContext};
use topup_store::{Config, EventHub};

#[derive(Clone)]
pub struct AppState {
    pub orders: OrderManager,
    pub bulk: Arc<BulkExecutor>,
    pub routing: Arc<RoutingStore>,
    pub catalog: Arc<PackageCatalog>,
    pub codes: Arc<CodeAllocator>,
    pub gateway: Arc<ProviderGateway>,
    pub events: Arc<EventHub>,
    pub balances: Arc<BalanceBoard>,
    pub tenant_id: String,
}

impl AppState {
    /// Wires every component from configuration on top of the given code store.
    pub async fn build(config: &Config, code_store: Arc<dyn CodeStore>) -> anyhow::Result<Self> {
        let currencies = Arc::new(
            CurrencyTable::with_rates(config.currencies.iter().map(|(c, r)| (c.clone(), *r)))
                .context("invalid currency table")?,
        );

        let catalog = Arc::new(PackageCatalog::with_packages(
            config.packages.iter().cloned().map(Package::from),
        ));

        let mut gateway = ProviderGateway::new(config.dispatch.provider_timeout());
        for seed in &config.providers {
            let provider = SimulatedProvider::new(&seed.id, seed.behavior)
                .with_latency(Duration::from_millis(seed.latency_ms))
                .with_balance(seed.balance);
            gateway = gateway.with_adapter(&seed.id, Arc::new(provider));
        }
        let gateway = Arc::new(gateway);

        let codes = Arc::new(CodeAllocator::new(code_store, config.dispatch.candidate_batch));
        for seed in &config.code_groups {
            match codes.create_group(&seed.id, &seed.name).await {
                Ok(_) | Err(CodeError::GroupExists(_)) => {}
                Err(e) => return Err(e).with_context(|| format!("invalid code group seed {}", seed.id)),
            }
        }

        let routing = Arc::new(RoutingStore::new());
        for seed in &config.routing {
            let plan = seed
                .plan()
                .with_context(|| format!("invalid routing seed for {}", seed.package_id))?;
            if let RoutingPlan::InternalCodes { code_group_id } = &plan {
                codes
                    .group(code_group_id)
                    .await
                    .with_context(|| format!("invalid routing seed for {}", seed.package_id))?;
            }
            routing
                .apply(&seed.package_id, plan)
                .with_context(|| format!("invalid routing seed for {}", seed.package_id))?;
        }

        let events = Arc::new(EventHub::new(config.dispatch.events_capacity));
        let orchestrator = Arc::new(FulfillmentOrchestrator::new(gateway.clone(), codes.clone()));

        let orders = OrderManager::new(
            TenantContext {
                id: config.tenant.id.clone(),
                local_currency: config.tenant.local_currency.to_uppercase(),
            },
            routing.clone(),
            catalog.clone(),
            currencies,
            orchestrator,
            events.clone(),
        );

        Ok(Self {
            bulk: Arc::new(BulkExecutor::new(orders.clone())),
            orders,
            routing,
            catalog,
            codes,
            gateway,
            events,
            balances: Arc::new(BalanceBoard::new()),
            tenant_id: config.tenant.id.clone(),
        })
    }
}
