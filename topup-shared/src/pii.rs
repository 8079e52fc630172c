use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps a buyer-supplied reference (player id, phone, e-mail) so that it never
/// shows up in `Debug`/`Display` output, which is what `tracing` fields use.
/// Serialization still yields the real value because API responses need it.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

impl Masked<String> {
    /// Last two characters only, for operator-facing log lines.
    pub fn hint(&self) -> String {
        let tail: String = self.0.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
        format!("***{}", tail)
    }
}

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl From<String> for Masked<String> {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_hides_debug_but_serializes() {
        let buyer = Masked::new("player-123456".to_string());

        assert_eq!(format!("{:?}", buyer), "********");
        assert_eq!(buyer.to_string(), "********");
        assert_eq!(serde_json::to_string(&buyer).unwrap(), "\"player-123456\"");
        assert_eq!(buyer.hint(), "***56");
    }

    #[test]
    fn test_masked_deserializes_transparently() {
        let buyer: Masked<String> = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(buyer.expose(), "abc");
    }
}
