use crate::legacy::repair_manual_unit_cost;
use serde::{Deserialize, Serialize};
use topup_catalog::ProviderType;

/// Settlement figures for one order. Any subset may be known; `reconcile`
/// fills in whatever can be derived.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialRecord {
    pub sell_usd: Option<f64>,
    pub sell_local: Option<f64>,
    pub cost_usd: Option<f64>,
    pub cost_local: Option<f64>,
    pub cost_per_unit_usd: Option<f64>,
    pub profit_usd: Option<f64>,
    pub profit_local: Option<f64>,
    pub fx_rate_at_order: Option<f64>,
    pub fx_rate_at_approval: Option<f64>,
    /// Effective rate used for derivation.
    pub fx_rate: Option<f64>,
    pub quantity: u32,
    pub provider_type: ProviderType,
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

fn to_usd(local: Option<f64>, rate: Option<f64>) -> Option<f64> {
    finite(Some(local? / rate?))
}

fn to_local(usd: Option<f64>, rate: Option<f64>) -> Option<f64> {
    finite(Some(usd? * rate?))
}

fn implied_rate(usd: Option<f64>, local: Option<f64>) -> Option<f64> {
    let usd = usd.filter(|u| *u != 0.0)?;
    positive(Some(local? / usd))
}

/// Derives every figure reachable from the known ones.
///
/// Explicit USD values win. Missing USD figures come from local values at the
/// effective rate (order time, then approval time, then a previously derived
/// rate). With no rate at all, one is implied from a figure known in both
/// currencies. Profit in USD always equals sell minus cost once both are
/// known. Fields with no precursor stay `None`.
pub fn reconcile(input: &FinancialRecord) -> FinancialRecord {
    let fx_rate_at_order = positive(input.fx_rate_at_order);
    let fx_rate_at_approval = positive(input.fx_rate_at_approval);
    let mut rate = fx_rate_at_order
        .or(fx_rate_at_approval)
        .or(positive(input.fx_rate));

    let sell_local = finite(input.sell_local);
    let cost_local = finite(input.cost_local);

    let mut sell_usd = finite(input.sell_usd).or_else(|| to_usd(sell_local, rate));
    let mut cost_usd = finite(input.cost_usd).or_else(|| to_usd(cost_local, rate));

    if cost_usd.is_none() {
        cost_usd = finite(input.cost_per_unit_usd).map(|per_unit| {
            repair_manual_unit_cost(input.provider_type, per_unit, rate) * f64::from(input.quantity)
        });
    }

    if rate.is_none() {
        rate = implied_rate(cost_usd, cost_local).or_else(|| implied_rate(sell_usd, sell_local));
        sell_usd = sell_usd.or_else(|| to_usd(sell_local, rate));
        cost_usd = cost_usd.or_else(|| to_usd(cost_local, rate));
    }

    let profit_usd = match (sell_usd, cost_usd) {
        (Some(sell), Some(cost)) => finite(Some(sell - cost)),
        _ => finite(input.profit_usd).or_else(|| to_usd(finite(input.profit_local), rate)),
    };

    let sell_local = sell_local.or_else(|| to_local(sell_usd, rate));
    let cost_local = cost_local.or_else(|| to_local(cost_usd, rate));
    let profit_local = finite(input.profit_local)
        .or_else(|| finite(Some(sell_local? - cost_local?)))
        .or_else(|| to_local(profit_usd, rate));

    FinancialRecord {
        sell_usd,
        sell_local,
        cost_usd,
        cost_local,
        cost_per_unit_usd: finite(input.cost_per_unit_usd),
        profit_usd,
        profit_local,
        fx_rate_at_order,
        fx_rate_at_approval,
        fx_rate: rate,
        quantity: input.quantity,
        provider_type: input.provider_type,
    }
}

/// Totals over reconciled records. Records missing a figure are counted
/// rather than treated as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitSummary {
    pub orders: usize,
    pub sell_usd: f64,
    pub cost_usd: f64,
    pub profit_usd: f64,
    pub sell_local: f64,
    pub cost_local: f64,
    pub profit_local: f64,
    pub incomplete: usize,
}

impl ProfitSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FinancialRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.orders += 1;
            match (record.sell_usd, record.cost_usd, record.profit_usd) {
                (Some(sell), Some(cost), Some(profit)) => {
                    summary.sell_usd += sell;
                    summary.cost_usd += cost;
                    summary.profit_usd += profit;
                }
                _ => summary.incomplete += 1,
            }
            summary.sell_local += record.sell_local.unwrap_or_default();
            summary.cost_local += record.cost_local.unwrap_or_default();
            summary.profit_local += record.profit_local.unwrap_or_default();
        }
        summary
    }
}
