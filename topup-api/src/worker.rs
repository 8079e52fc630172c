use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use topup_core::supplier::{Balance, ProviderGateway};
use tracing::{debug, info, warn};

/// Latest balance reading for one provider.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceReading {
    pub provider_id: String,
    pub balance: Option<Balance>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Read model written only by the poller.
#[derive(Default)]
pub struct BalanceBoard {
    readings: RwLock<BTreeMap<String, BalanceReading>>,
}

impl BalanceBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reading: BalanceReading) {
        let mut readings = self.readings.write().unwrap_or_else(|p| p.into_inner());
        readings.insert(reading.provider_id.clone(), reading);
    }

    pub fn snapshot(&self) -> Vec<BalanceReading> {
        let readings = self.readings.read().unwrap_or_else(|p| p.into_inner());
        readings.values().cloned().collect()
    }
}

/// Polls every registered provider once. A failing provider keeps its last
/// good balance and gets the error attached.
pub async fn poll_balances(gateway: &ProviderGateway, board: &BalanceBoard) {
    let previous: BTreeMap<String, BalanceReading> = board
        .snapshot()
        .into_iter()
        .map(|r| (r.provider_id.clone(), r))
        .collect();

    for provider_id in gateway.provider_ids().await {
        let reading = match gateway.fetch_balance(&provider_id).await {
            Ok(balance) => {
                debug!("Balance for {}: {}", provider_id, balance.amount);
                BalanceReading {
                    provider_id,
                    balance: Some(balance),
                    error: None,
                    checked_at: Utc::now(),
                }
            }
            Err(e) => {
                warn!("Balance poll failed for {}: {}", provider_id, e);
                BalanceReading {
                    balance: previous.get(&provider_id).and_then(|r| r.balance.clone()),
                    provider_id,
                    error: Some(e.to_string()),
                    checked_at: Utc::now(),
                }
            }
        };
        board.record(reading);
    }
}

pub async fn start_balance_worker(
    gateway: Arc<ProviderGateway>,
    board: Arc<BalanceBoard>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Balance worker started, polling every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => poll_balances(&gateway, &board).await,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Balance worker stopped");
}
