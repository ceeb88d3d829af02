//! Board pins

use crate::capability::{Capability, CapabilitySet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named pin on the board
///
/// Several names can refer to the same physical pin (`LED` and `D13`, say).
/// Aliases share a `number`, and claims are tracked per number, so holding
/// one alias makes every other alias of that pin unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pin {
    /// Board-level name, unique within a catalog
    pub name: String,
    /// Physical pin number
    pub number: u16,
    /// Microcontroller port name, for diagnostics
    pub mcu_name: String,
    /// Functions this pin can serve
    pub capabilities: CapabilitySet,
}

impl Pin {
    /// Creates a pin description
    pub fn new(
        name: impl Into<String>,
        number: u16,
        mcu_name: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            name: name.into(),
            number,
            mcu_name: mcu_name.into(),
            capabilities,
        }
    }

    /// Returns true if this pin can serve the capability
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }

    /// Returns true if both names refer to the same physical pin
    pub fn aliases(&self, other: &Pin) -> bool {
        self.number == other.number
    }
}

impl fmt::Display for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.mcu_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_supports() {
        let pin = Pin::new(
            "A0",
            14,
            "PA14",
            CapabilitySet::of(&[Capability::DigitalIo, Capability::AnalogIn]),
        );
        assert!(pin.supports(Capability::AnalogIn));
        assert!(!pin.supports(Capability::I2c));
    }

    #[test]
    fn test_pin_aliases() {
        let led = Pin::new("LED", 13, "PA13", CapabilitySet::EMPTY);
        let d13 = Pin::new("D13", 13, "PA13", CapabilitySet::EMPTY);
        let d12 = Pin::new("D12", 12, "PA12", CapabilitySet::EMPTY);
        assert!(led.aliases(&d13));
        assert!(!led.aliases(&d12));
        assert_eq!(led.to_string(), "LED (PA13)");
    }
}
