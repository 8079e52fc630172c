pub mod bulk;
pub mod finance;
pub mod legacy;
pub mod manager;
pub mod models;
pub mod orchestrator;

pub use bulk::{BulkAction, BulkExecutor, BulkItemOutcome, BulkItemResult, BulkReport};
pub use finance::{reconcile, FinancialRecord, ProfitSummary};
pub use manager::{ActionOutcome, OrderError, OrderFilter, OrderManager, OrderPage, TenantContext};
pub use models::{DispatchState, Order, OrderStatus, OrderView};
pub use orchestrator::FulfillmentOrchestrator;
