use topup_catalog::ProviderType;

/// Manual orders imported from the old ledger sometimes stored the per-unit
/// cost in local currency while labelling it USD. A manual unit cost above
/// this ceiling with a rate above the floor is treated as local.
pub const LEGACY_UNIT_COST_CEILING_USD: f64 = 10.0;
pub const LEGACY_RATE_FLOOR: f64 = 30.0;

/// Returns the per-unit USD cost, undoing the local-currency mislabel on
/// legacy manual records. Any other record passes through unchanged.
pub fn repair_manual_unit_cost(provider_type: ProviderType, per_unit: f64, rate: Option<f64>) -> f64 {
    match rate {
        Some(rate)
            if provider_type == ProviderType::Manual
                && per_unit > LEGACY_UNIT_COST_CEILING_USD
                && rate > LEGACY_RATE_FLOOR =>
        {
            per_unit / rate
        }
        _ => per_unit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repairs_only_mislabelled_manual_costs() {
        let repaired = repair_manual_unit_cost(ProviderType::Manual, 25.0, Some(35.0));
        assert!((repaired - 25.0 / 35.0).abs() < 1e-12);

        assert_eq!(repair_manual_unit_cost(ProviderType::External, 25.0, Some(35.0)), 25.0);
        assert_eq!(repair_manual_unit_cost(ProviderType::Manual, 9.0, Some(35.0)), 9.0);
        assert_eq!(repair_manual_unit_cost(ProviderType::Manual, 25.0, Some(20.0)), 25.0);
        assert_eq!(repair_manual_unit_cost(ProviderType::Manual, 25.0, None), 25.0);
    }
}
