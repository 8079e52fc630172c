use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use topup_core::ErrorKind;

/// How an order for a package gets fulfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[default]
    Manual,
    External,
    InternalCodes,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Manual => "manual",
            ProviderType::External => "external",
            ProviderType::InternalCodes => "internal_codes",
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(ProviderType::Manual),
            "external" | "auto" => Ok(ProviderType::External),
            "internal_codes" | "codes" => Ok(ProviderType::InternalCodes),
            other => Err(RoutingError::InvalidRouting(format!("unknown mode {}", other))),
        }
    }
}

/// A package's routing policy. Each variant carries exactly the fields its
/// mode needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoutingPlan {
    #[default]
    Manual,
    External {
        primary: String,
        fallback: Option<String>,
    },
    InternalCodes {
        code_group_id: String,
    },
}

impl RoutingPlan {
    pub fn provider_type(&self) -> ProviderType {
        match self {
            RoutingPlan::Manual => ProviderType::Manual,
            RoutingPlan::External { .. } => ProviderType::External,
            RoutingPlan::InternalCodes { .. } => ProviderType::InternalCodes,
        }
    }

    pub fn external(primary: &str, fallback: Option<&str>) -> Result<Self, RoutingError> {
        let primary = primary.trim();
        if primary.is_empty() {
            return Err(RoutingError::InvalidRouting("primary provider is required".into()));
        }
        let fallback = match fallback.map(str::trim) {
            None | Some("") => None,
            Some(f) if f == primary => {
                return Err(RoutingError::InvalidRouting(
                    "fallback provider must differ from primary".into(),
                ))
            }
            Some(f) => Some(f.to_string()),
        };
        Ok(RoutingPlan::External {
            primary: primary.to_string(),
            fallback,
        })
    }

    pub fn internal_codes(code_group_id: &str) -> Result<Self, RoutingError> {
        let code_group_id = code_group_id.trim();
        if code_group_id.is_empty() {
            return Err(RoutingError::InvalidRouting("code group is required".into()));
        }
        Ok(RoutingPlan::InternalCodes {
            code_group_id: code_group_id.to_string(),
        })
    }
}

/// Flat wire form of a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPolicyView {
    pub package_id: String,
    pub mode: ProviderType,
    pub primary_provider_id: Option<String>,
    pub fallback_provider_id: Option<String>,
    pub code_group_id: Option<String>,
}

impl RoutingPolicyView {
    pub fn from_plan(package_id: &str, plan: &RoutingPlan) -> Self {
        let (primary, fallback, group) = match plan {
            RoutingPlan::Manual => (None, None, None),
            RoutingPlan::External { primary, fallback } => {
                (Some(primary.clone()), fallback.clone(), None)
            }
            RoutingPlan::InternalCodes { code_group_id } => {
                (None, None, Some(code_group_id.clone()))
            }
        };
        Self {
            package_id: package_id.to_string(),
            mode: plan.provider_type(),
            primary_provider_id: primary,
            fallback_provider_id: fallback,
            code_group_id: group,
        }
    }

    /// Converts a submitted view into a plan, rejecting fields that do not
    /// belong to the chosen mode.
    pub fn into_plan(self) -> Result<RoutingPlan, RoutingError> {
        match self.mode {
            ProviderType::Manual => Ok(RoutingPlan::Manual),
            ProviderType::External => {
                if self.code_group_id.is_some() {
                    return Err(RoutingError::InvalidRouting(
                        "code group is not allowed in external mode".into(),
                    ));
                }
                RoutingPlan::external(
                    self.primary_provider_id.as_deref().unwrap_or_default(),
                    self.fallback_provider_id.as_deref(),
                )
            }
            ProviderType::InternalCodes => {
                if self.primary_provider_id.is_some() || self.fallback_provider_id.is_some() {
                    return Err(RoutingError::InvalidRouting(
                        "providers are not allowed in internal_codes mode".into(),
                    ));
                }
                RoutingPlan::internal_codes(self.code_group_id.as_deref().unwrap_or_default())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingStats {
    pub manual: usize,
    pub external: usize,
    pub external_with_fallback: usize,
    pub internal_codes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("Invalid routing: {0}")]
    InvalidRouting(String),
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRouting
    }
}

/// Per-package routing policies. Unset packages resolve to manual.
pub struct RoutingStore {
    policies: RwLock<HashMap<String, RoutingPlan>>,
}

impl RoutingStore {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, package_id: &str) -> RoutingPlan {
        let policies = self.policies.read().unwrap_or_else(|p| p.into_inner());
        policies.get(package_id).cloned().unwrap_or_default()
    }

    pub fn view(&self, package_id: &str) -> RoutingPolicyView {
        RoutingPolicyView::from_plan(package_id, &self.resolve(package_id))
    }

    /// Replaces the whole policy after validating it.
    pub fn apply(&self, package_id: &str, plan: RoutingPlan) -> Result<RoutingPlan, RoutingError> {
        let plan = match plan {
            RoutingPlan::Manual => RoutingPlan::Manual,
            RoutingPlan::External { primary, fallback } => {
                RoutingPlan::external(&primary, fallback.as_deref())?
            }
            RoutingPlan::InternalCodes { code_group_id } => {
                RoutingPlan::internal_codes(&code_group_id)?
            }
        };
        self.update(package_id, |_| Ok(plan))
    }

    pub fn set_mode(&self, package_id: &str, mode: ProviderType) -> Result<RoutingPlan, RoutingError> {
        self.update(package_id, |current| match (mode, current) {
            (ProviderType::Manual, _) => Ok(RoutingPlan::Manual),
            (m, current) if current.provider_type() == m => Ok(current.clone()),
            (ProviderType::External, _) => Err(RoutingError::InvalidRouting(
                "external mode needs a primary provider".into(),
            )),
            (ProviderType::InternalCodes, _) => Err(RoutingError::InvalidRouting(
                "internal_codes mode needs a code group".into(),
            )),
        })
    }

    pub fn set_providers(
        &self,
        package_id: &str,
        primary: &str,
        fallback: Option<&str>,
    ) -> Result<RoutingPlan, RoutingError> {
        let plan = RoutingPlan::external(primary, fallback)?;
        self.update(package_id, |_| Ok(plan))
    }

    pub fn set_code_group(&self, package_id: &str, group_id: &str) -> Result<RoutingPlan, RoutingError> {
        let plan = RoutingPlan::internal_codes(group_id)?;
        self.update(package_id, |_| Ok(plan))
    }

    pub fn stats(&self) -> RoutingStats {
        let policies = self.policies.read().unwrap_or_else(|p| p.into_inner());
        let mut stats = RoutingStats::default();
        for plan in policies.values() {
            match plan {
                RoutingPlan::Manual => stats.manual += 1,
                RoutingPlan::External { fallback, .. } => {
                    stats.external += 1;
                    if fallback.is_some() {
                        stats.external_with_fallback += 1;
                    }
                }
                RoutingPlan::InternalCodes { .. } => stats.internal_codes += 1,
            }
        }
        stats
    }

    fn update<F>(&self, package_id: &str, next: F) -> Result<RoutingPlan, RoutingError>
    where
        F: FnOnce(&RoutingPlan) -> Result<RoutingPlan, RoutingError>,
    {
        let mut policies = self.policies.write().unwrap_or_else(|p| p.into_inner());
        let current = policies.get(package_id).cloned().unwrap_or_default();
        let plan = next(&current)?;
        if plan != current {
            tracing::info!(
                "Routing for package {} changed: {} -> {}",
                package_id,
                current.provider_type().as_str(),
                plan.provider_type().as_str()
            );
        }
        policies.insert(package_id.to_string(), plan.clone());
        Ok(plan)
    }
}

impl Default for RoutingStore {
    fn default() -> Self {
        Self::new()
    }
}
