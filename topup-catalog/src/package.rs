use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Sellable top-up package with its USD unit prices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: String,
    pub name: String,
    pub unit_sell_usd: f64,
    pub unit_cost_usd: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("Package not found: {0}")]
    NotFound(String),

    #[error("Package not available: {0}")]
    NotAvailable(String),
}

/// Read-mostly price lookup, seeded at startup.
pub struct PackageCatalog {
    packages: RwLock<HashMap<String, Package>>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self {
            packages: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_packages(packages: impl IntoIterator<Item = Package>) -> Self {
        let catalog = Self::new();
        for package in packages {
            catalog.upsert(package);
        }
        catalog
    }

    pub fn upsert(&self, package: Package) {
        let mut packages = self.packages.write().unwrap_or_else(|p| p.into_inner());
        packages.insert(package.id.clone(), package);
    }

    /// Returns an active package.
    pub fn get(&self, id: &str) -> Result<Package, PackageError> {
        let packages = self.packages.read().unwrap_or_else(|p| p.into_inner());
        let package = packages
            .get(id)
            .ok_or_else(|| PackageError::NotFound(id.to_string()))?;
        if !package.is_active {
            return Err(PackageError::NotAvailable(id.to_string()));
        }
        Ok(package.clone())
    }

    pub fn list(&self) -> Vec<Package> {
        let packages = self.packages.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Package> = packages.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

impl Default for PackageCatalog {
    fn default() -> Self {
        Self::new()
    }
}
