use crate::manager::{ActionOutcome, OrderError, OrderManager};
use crate::models::DispatchState;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use topup_core::ErrorKind;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum BulkAction {
    Approve,
    Reject,
    SetManual,
    Dispatch { provider_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum BulkItemOutcome {
    Applied {
        /// Set when the action produced or re-ran a dispatch.
        #[serde(skip_serializing_if = "Option::is_none")]
        dispatched_order_id: Option<Uuid>,
        changed: bool,
    },
    Skipped {
        kind: ErrorKind,
    },
    Failed {
        kind: Option<ErrorKind>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub order_id: Uuid,
    #[serde(flatten)]
    pub outcome: BulkItemOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReport {
    pub results: Vec<BulkItemResult>,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl BulkReport {
    fn from_results(results: Vec<BulkItemResult>) -> Self {
        let mut report = Self {
            results: Vec::new(),
            succeeded: 0,
            skipped: 0,
            failed: 0,
        };
        for item in &results {
            match item.outcome {
                BulkItemOutcome::Applied { .. } => report.succeeded += 1,
                BulkItemOutcome::Skipped { .. } => report.skipped += 1,
                BulkItemOutcome::Failed { .. } => report.failed += 1,
            }
        }
        report.results = results;
        report
    }
}

fn to_item(order_id: Uuid, result: Result<ActionOutcome, OrderError>) -> BulkItemResult {
    let outcome = match result {
        Ok(ActionOutcome::Applied) => BulkItemOutcome::Applied {
            dispatched_order_id: None,
            changed: true,
        },
        Ok(ActionOutcome::Unchanged) => BulkItemOutcome::Applied {
            dispatched_order_id: None,
            changed: false,
        },
        Ok(ActionOutcome::Skipped { kind }) => BulkItemOutcome::Skipped { kind },
        Ok(ActionOutcome::Dispatched {
            order_id: dispatched,
            state,
            failure,
        }) => match (state, failure) {
            (DispatchState::Failed, Some(failure)) => BulkItemOutcome::Failed {
                kind: Some(failure.kind),
                message: failure.message,
            },
            _ => BulkItemOutcome::Applied {
                dispatched_order_id: Some(dispatched),
                changed: true,
            },
        },
        Err(e) => BulkItemOutcome::Failed {
            kind: e.kind(),
            message: e.to_string(),
        },
    };
    BulkItemResult { order_id, outcome }
}

/// Applies one action to many orders concurrently. Each order is still
/// serialized by its own lock; results keep the input order.
pub struct BulkExecutor {
    manager: OrderManager,
}

impl BulkExecutor {
    pub fn new(manager: OrderManager) -> Self {
        Self { manager }
    }

    pub async fn run(&self, action: &BulkAction, ids: &[Uuid], note: Option<String>) -> BulkReport {
        let tasks = ids.iter().map(|&id| {
            let manager = self.manager.clone();
            let note = note.clone();
            async move {
                let result = match action {
                    BulkAction::Approve => manager.approve(id, note).await,
                    BulkAction::Reject => manager.reject(id, note).await,
                    BulkAction::SetManual => manager.set_manual(id, note).await,
                    BulkAction::Dispatch { provider_id } => {
                        manager.dispatch(id, provider_id.clone(), note).await
                    }
                };
                to_item(id, result)
            }
        });
        let report = BulkReport::from_results(join_all(tasks).await);
        tracing::info!(
            "Bulk {:?} over {} orders: {} ok, {} skipped, {} failed",
            action,
            ids.len(),
            report.succeeded,
            report.skipped,
            report.failed
        );
        report
    }
}
