//! # Capabilities
//!
//! A capability is one kind of hardware function: digital I/O, analog
//! input, a bus role. Pins declare the capabilities they can serve and
//! providers declare the capabilities they implement. Both use the same
//! [`CapabilitySet`] so checks are a single intersection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single hardware capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DigitalIo,
    AnalogIn,
    AnalogOut,
    Pwm,
    I2c,
    Spi,
    Uart,
}

impl Capability {
    /// All capabilities, in bit order
    pub const ALL: [Capability; 7] = [
        Capability::DigitalIo,
        Capability::AnalogIn,
        Capability::AnalogOut,
        Capability::Pwm,
        Capability::I2c,
        Capability::Spi,
        Capability::Uart,
    ];

    const fn bit(self) -> u32 {
        match self {
            Capability::DigitalIo => 1 << 0,
            Capability::AnalogIn => 1 << 1,
            Capability::AnalogOut => 1 << 2,
            Capability::Pwm => 1 << 3,
            Capability::I2c => 1 << 4,
            Capability::Spi => 1 << 5,
            Capability::Uart => 1 << 6,
        }
    }

    /// Short lowercase name, as used in diagnostics
    pub fn name(self) -> &'static str {
        match self {
            Capability::DigitalIo => "digital_io",
            Capability::AnalogIn => "analog_in",
            Capability::AnalogOut => "analog_out",
            Capability::Pwm => "pwm",
            Capability::I2c => "i2c",
            Capability::Spi => "spi",
            Capability::Uart => "uart",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of capabilities
///
/// Serialized as its bit mask so that exported board descriptions stay
/// compact and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    /// Builds a set from a list of capabilities
    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Every capability
    pub const fn all() -> Self {
        Self::of(&Capability::ALL)
    }

    /// Builds a set from a raw bit mask, dropping unknown bits
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::all().0)
    }

    /// Returns the raw bit mask
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if the capability is in the set
    pub const fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// Returns a copy with the capability added
    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    /// Returns true if the set is empty
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates the capabilities in the set
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|cap| self.contains(*cap))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Capability::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
