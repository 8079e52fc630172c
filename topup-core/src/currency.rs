use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

pub const SETTLEMENT_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Currency {
    pub code: String,
    /// Units of this currency per one USD.
    pub rate_per_usd: f64,
    pub is_active: bool,
}

/// Current local-per-USD rate lookup used when an order is created or approved.
pub trait FxTable: Send + Sync {
    fn rate(&self, code: &str) -> Option<f64>;
}

pub struct CurrencyTable {
    currencies: RwLock<HashMap<String, Currency>>,
}

impl CurrencyTable {
    pub fn new() -> Self {
        let mut currencies = HashMap::new();
        currencies.insert(
            SETTLEMENT_CURRENCY.to_string(),
            Currency {
                code: SETTLEMENT_CURRENCY.to_string(),
                rate_per_usd: 1.0,
                is_active: true,
            },
        );
        Self {
            currencies: RwLock::new(currencies),
        }
    }

    pub fn with_rates<I, S>(rates: I) -> CoreResult<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let table = Self::new();
        for (code, rate) in rates {
            table.upsert(code, rate)?;
        }
        Ok(table)
    }

    pub fn upsert(&self, code: impl Into<String>, rate_per_usd: f64) -> CoreResult<Currency> {
        let code = code.into().trim().to_uppercase();
        if code.is_empty() {
            return Err(CoreError::ValidationError("currency code is empty".into()));
        }
        if code == SETTLEMENT_CURRENCY && rate_per_usd != 1.0 {
            return Err(CoreError::ValidationError("USD rate is fixed at 1".into()));
        }
        if !rate_per_usd.is_finite() || rate_per_usd <= 0.0 {
            return Err(CoreError::ValidationError(format!(
                "rate for {} must be a positive number",
                code
            )));
        }

        let currency = Currency {
            code: code.clone(),
            rate_per_usd,
            is_active: true,
        };
        let mut currencies = self
            .currencies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        currencies.insert(code, currency.clone());
        Ok(currency)
    }

    pub fn deactivate(&self, code: &str) -> CoreResult<()> {
        let code = code.trim().to_uppercase();
        if code == SETTLEMENT_CURRENCY {
            return Err(CoreError::ValidationError("USD cannot be deactivated".into()));
        }
        let mut currencies = self
            .currencies
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match currencies.get_mut(&code) {
            Some(c) => {
                c.is_active = false;
                Ok(())
            }
            None => Err(CoreError::UnknownCurrency(code)),
        }
    }

    pub fn list(&self) -> Vec<Currency> {
        let currencies = self
            .currencies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut all: Vec<Currency> = currencies.values().cloned().collect();
        all.sort_by(|a, b| a.code.cmp(&b.code));
        all
    }
}

impl Default for CurrencyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FxTable for CurrencyTable {
    fn rate(&self, code: &str) -> Option<f64> {
        let currencies = self
            .currencies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        currencies
            .get(&code.trim().to_uppercase())
            .filter(|c| c.is_active)
            .map(|c| c.rate_per_usd)
    }
}
