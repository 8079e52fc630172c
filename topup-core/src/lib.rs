pub mod currency;
pub mod simulated;
pub mod supplier;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of failure kinds the engine reports to callers.
///
/// Concrete error types in each crate map onto one of these through a
/// `kind()` accessor so bulk results and dispatch records stay comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRouting,
    CodesExhausted,
    ProviderTimeout,
    ProviderRejected,
    AlreadyTerminal,
    ConcurrentClaimConflict,
    MalformedBulkImportLine,
    /// Storage or runtime failure outside the business taxonomy.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRouting => "INVALID_ROUTING",
            ErrorKind::CodesExhausted => "CODES_EXHAUSTED",
            ErrorKind::ProviderTimeout => "PROVIDER_TIMEOUT",
            ErrorKind::ProviderRejected => "PROVIDER_REJECTED",
            ErrorKind::AlreadyTerminal => "ALREADY_TERMINAL",
            ErrorKind::ConcurrentClaimConflict => "CONCURRENT_CLAIM_CONFLICT",
            ErrorKind::MalformedBulkImportLine => "MALFORMED_BULK_IMPORT_LINE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Dispatch-time kinds are recorded on the order instead of being returned.
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::CodesExhausted | ErrorKind::ProviderTimeout | ErrorKind::ProviderRejected
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    ValidationError(String),
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_like_display() {
        for kind in [
            ErrorKind::InvalidRouting,
            ErrorKind::CodesExhausted,
            ErrorKind::ProviderTimeout,
            ErrorKind::AlreadyTerminal,
            ErrorKind::MalformedBulkImportLine,
        ] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.to_string());
        }
    }

    #[test]
    fn test_dispatch_failure_kinds() {
        assert!(ErrorKind::ProviderTimeout.is_dispatch_failure());
        assert!(ErrorKind::CodesExhausted.is_dispatch_failure());
        assert!(!ErrorKind::InvalidRouting.is_dispatch_failure());
        assert!(!ErrorKind::AlreadyTerminal.is_dispatch_failure());
    }
}
