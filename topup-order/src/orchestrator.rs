use crate::models::{AttemptOutcome, IssuedCode, Order};
use std::sync::Arc;
use topup_catalog::codes::{Code, CodeAllocator, CodeError, CodeStatus};
use topup_catalog::RoutingPlan;
use topup_core::supplier::{GatewayError, ProviderGateway, SubmitRequest};
use topup_core::ErrorKind;

/// Executes a routing plan against an order. Dispatch failures are recorded
/// on the order, never returned.
pub struct FulfillmentOrchestrator {
    gateway: Arc<ProviderGateway>,
    allocator: Arc<CodeAllocator>,
}

impl FulfillmentOrchestrator {
    pub fn new(gateway: Arc<ProviderGateway>, allocator: Arc<CodeAllocator>) -> Self {
        Self { gateway, allocator }
    }

    pub fn gateway(&self) -> &Arc<ProviderGateway> {
        &self.gateway
    }

    pub fn allocator(&self) -> &Arc<CodeAllocator> {
        &self.allocator
    }

    pub async fn execute(&self, order: &mut Order, plan: &RoutingPlan) {
        order.provider_type = plan.provider_type();
        order.mark_dispatching();
        match plan {
            RoutingPlan::Manual => {
                order.provider_id = None;
                order.mark_fulfilled();
                tracing::info!("Order {} left for manual fulfillment", order.id);
            }
            RoutingPlan::InternalCodes { code_group_id } => {
                order.provider_id = None;
                self.issue_codes(order, code_group_id).await;
            }
            RoutingPlan::External { primary, fallback } => {
                self.submit_with_fallback(order, primary, fallback.as_deref())
                    .await;
            }
        }
    }

    async fn issue_codes(&self, order: &mut Order, group_id: &str) {
        let node = format!("code-group:{}", group_id);
        let mut claimed: Vec<Code> = Vec::with_capacity(order.quantity as usize);

        for _ in 0..order.quantity {
            match self.allocator.claim(group_id, order.id).await {
                Ok(code) => claimed.push(code),
                Err(e) => {
                    for code in &claimed {
                        if let Err(release_err) = self.allocator.release(code.id).await {
                            tracing::error!(
                                "Could not release code {} after failed claim: {}",
                                code.id,
                                release_err
                            );
                        }
                    }
                    let kind = match e {
                        CodeError::GroupNotFound(_) => ErrorKind::InvalidRouting,
                        _ => e.kind().unwrap_or(ErrorKind::Internal),
                    };
                    tracing::warn!("Order {} could not get codes from {}: {}", order.id, group_id, e);
                    order.record_attempt(
                        &node,
                        AttemptOutcome::Failed {
                            kind,
                            message: e.to_string(),
                        },
                    );
                    order.mark_failed(kind, e.to_string());
                    return;
                }
            }
        }

        let cost: f64 = claimed.iter().map(|c| c.cost).sum();
        order.codes = claimed
            .into_iter()
            .map(|c| IssuedCode {
                code_id: c.id,
                pin: c.pin,
                serial: c.serial,
                cost: c.cost,
            })
            .collect();
        order.financials.restamp_cost(cost);
        order.record_attempt(&node, AttemptOutcome::Success { external_order_id: None });
        order.mark_fulfilled();
        tracing::info!("Order {} issued {} code(s) from {}", order.id, order.codes.len(), group_id);
    }

    async fn submit_with_fallback(&self, order: &mut Order, primary: &str, fallback: Option<&str>) {
        let first = self.attempt(order, primary).await;
        let last_error = match first {
            Ok(()) => return,
            Err(e) => e,
        };

        let last_error = match fallback.filter(|f| *f != primary) {
            Some(fallback) => {
                tracing::warn!(
                    "Order {} failed on {} ({}), falling back to {}",
                    order.id,
                    primary,
                    last_error.kind,
                    fallback
                );
                match self.attempt(order, fallback).await {
                    Ok(()) => {
                        order.annotate_fallback(primary, fallback);
                        return;
                    }
                    Err(e) => e,
                }
            }
            None => last_error,
        };

        tracing::warn!("Order {} dispatch failed: {}", order.id, last_error);
        order.mark_failed(last_error.kind, last_error.message);
    }

    async fn attempt(&self, order: &mut Order, provider_id: &str) -> Result<(), GatewayError> {
        let request = SubmitRequest {
            order_id: order.id,
            package_id: order.package_id.clone(),
            quantity: order.quantity,
            buyer_ref: order.buyer_ref.expose().clone(),
        };
        match self.gateway.submit(provider_id, &request).await {
            Ok(receipt) => {
                order.record_attempt(
                    provider_id,
                    AttemptOutcome::Success {
                        external_order_id: Some(receipt.external_order_id.clone()),
                    },
                );
                order.provider_id = Some(provider_id.to_string());
                order.external_order_id = Some(receipt.external_order_id);
                order.provider_message = receipt.message;
                order.pin_code = receipt.pin;
                order.image_url = receipt.image_url;
                order.mark_fulfilled();
                tracing::info!("Order {} accepted by {}", order.id, provider_id);
                Ok(())
            }
            Err(e) => {
                order.record_attempt(
                    provider_id,
                    AttemptOutcome::Failed {
                        kind: e.kind,
                        message: e.message.clone(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Marks every reserved code of the order as used, or none of them.
    /// Codes this order already used count as committed.
    pub async fn commit_codes(&self, order: &Order) -> Result<(), CodeError> {
        let mut pending = Vec::with_capacity(order.codes.len());
        for code in &order.codes {
            let current = self.allocator.check_commit(code.code_id, order.id).await?;
            if current.status == CodeStatus::Reserved {
                pending.push(code.code_id);
            }
        }

        let mut committed = Vec::with_capacity(pending.len());
        for code_id in pending {
            match self.allocator.commit(code_id, order.id).await {
                Ok(_) => committed.push(code_id),
                Err(e) => {
                    for done in committed {
                        if let Err(revert_err) = self.allocator.revert_commit(done, order.id).await {
                            tracing::error!(
                                "Order {}: could not revert commit of code {}: {}",
                                order.id,
                                done,
                                revert_err
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Releases reserved codes and cancels a live external order. Both are
    /// best effort; failures are logged.
    pub async fn unwind(&self, order: &mut Order) {
        for code in order.codes.drain(..) {
            if let Err(e) = self.allocator.release(code.code_id).await {
                tracing::warn!("Order {}: could not release code {}: {}", order.id, code.code_id, e);
            }
        }
        if let (Some(provider_id), Some(external_id)) =
            (order.provider_id.as_deref(), order.external_order_id.as_deref())
        {
            if let Err(e) = self.gateway.cancel(provider_id, external_id).await {
                tracing::warn!(
                    "Order {}: cancel of {} on {} failed: {}",
                    order.id,
                    external_id,
                    provider_id,
                    e
                );
            }
        }
        order.external_order_id = None;
        order.pin_code = None;
        order.image_url = None;
    }
}
