//! Units attached to numeric value types.

use serde::{Deserialize, Serialize};

/// Unit of measure for a numeric cell value.
///
/// `si_prefix_ok` tells display code whether scaling the value with SI
/// prefixes (kHz, MHz, ...) is meaningful for this unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub symbol: String,
    pub si_prefix_ok: bool,
}

impl Unit {
    pub fn new(symbol: &str, si_prefix_ok: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            si_prefix_ok,
        }
    }

    /// The dimensionless unit (empty symbol).
    pub fn none() -> Self {
        Self::new("", false)
    }

    pub fn is_none(&self) -> bool {
        self.symbol.is_empty()
    }

    pub fn hertz() -> Self {
        Self::new("Hz", true)
    }

    pub fn second() -> Self {
        Self::new("s", true)
    }

    pub fn decibel() -> Self {
        Self::new("dB", false)
    }

    pub fn dbm() -> Self {
        Self::new("dBm", false)
    }

    pub fn dbfs() -> Self {
        Self::new("dBFS", false)
    }

    pub fn degree() -> Self {
        Self::new("\u{b0}", false)
    }

    pub fn ppm() -> Self {
        Self::new("ppm", false)
    }
}

impl Default for Unit {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_none() {
        assert!(Unit::none().is_none());
        assert!(!Unit::hertz().is_none());
    }

    #[test]
    fn serializes_as_object() {
        let json = serde_json::to_value(Unit::hertz()).unwrap();
        assert_eq!(json["symbol"], "Hz");
        assert_eq!(json["si_prefix_ok"], true);
    }
}
