use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use topup_catalog::{Package, ProviderType, RoutingError, RoutingPlan, RoutingPolicyView};
use topup_core::simulated::SimulatedBehavior;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub tenant: TenantConfig,
    pub dispatch: DispatchConfig,
    pub database: Option<DatabaseConfig>,
    /// Local units per USD, keyed by currency code.
    #[serde(default)]
    pub currencies: HashMap<String, f64>,
    #[serde(default)]
    pub packages: Vec<PackageSeed>,
    #[serde(default)]
    pub providers: Vec<ProviderSeed>,
    #[serde(default)]
    pub code_groups: Vec<CodeGroupSeed>,
    #[serde(default)]
    pub routing: Vec<RoutingSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TenantConfig {
    pub id: String,
    pub local_currency: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    pub provider_timeout_ms: u64,
    pub balance_poll_seconds: u64,
    #[serde(default = "default_candidate_batch")]
    pub candidate_batch: usize,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

fn default_candidate_batch() -> usize {
    8
}

fn default_events_capacity() -> usize {
    256
}

impl DispatchConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_timeout_ms)
    }

    pub fn balance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.balance_poll_seconds.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PackageSeed {
    pub id: String,
    pub name: String,
    pub unit_sell_usd: f64,
    pub unit_cost_usd: f64,
}

impl From<PackageSeed> for Package {
    fn from(seed: PackageSeed) -> Self {
        Package {
            id: seed.id,
            name: seed.name,
            unit_sell_usd: seed.unit_sell_usd,
            unit_cost_usd: seed.unit_cost_usd,
            is_active: true,
        }
    }
}

/// A simulated supplier registered at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSeed {
    pub id: String,
    #[serde(default)]
    pub behavior: SimulatedBehavior,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default = "default_balance")]
    pub balance: f64,
}

fn default_balance() -> f64 {
    100.0
}

/// Created at startup unless it already exists.
#[derive(Debug, Deserialize, Clone)]
pub struct CodeGroupSeed {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoutingSeed {
    pub package_id: String,
    pub mode: ProviderType,
    pub primary_provider_id: Option<String>,
    pub fallback_provider_id: Option<String>,
    pub code_group_id: Option<String>,
}

impl RoutingSeed {
    pub fn plan(&self) -> Result<RoutingPlan, RoutingError> {
        RoutingPolicyView {
            package_id: self.package_id.clone(),
            mode: self.mode,
            primary_provider_id: self.primary_provider_id.clone(),
            fallback_provider_id: self.fallback_provider_id.clone(),
            code_group_id: self.code_group_id.clone(),
        }
        .into_plan()
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TOPUP_DISPATCH__PROVIDER_TIMEOUT_MS=500`
            .add_source(config::Environment::with_prefix("TOPUP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
