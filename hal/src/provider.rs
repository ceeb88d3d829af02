//! # HAL providers
//!
//! A provider is the backend that actually touches hardware. Exactly one
//! provider is active per [`Hal`](crate::Hal) context; every peripheral
//! operation is routed to it.
//!
//! Providers only implement mechanism. Claim tracking, mode checks, value
//! scaling and capability validation happen in the context before the
//! provider is reached, which keeps observable behavior identical across
//! backends.
//!
//! Every operation has a default implementation that fails with
//! [`HalError::CapabilityUnsupported`], so a provider implements only what
//! it declares in [`HalProvider::capabilities`].

use crate::capability::{Capability, CapabilitySet};
use crate::error::HalError;
use crate::pin::Pin;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which family of backend a provider belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process peripheral model
    Native,
    /// Hardware reached through the host runtime
    HostBridged,
    /// Supports nothing
    Null,
}

/// Role a claimed pin is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    Digital,
    AnalogIn,
    AnalogOut,
    I2c,
    Spi,
}

impl PinMode {
    /// Capability the pin and provider need for this mode
    pub fn capability(self) -> Capability {
        match self {
            PinMode::Digital => Capability::DigitalIo,
            PinMode::AnalogIn => Capability::AnalogIn,
            PinMode::AnalogOut => Capability::AnalogOut,
            PinMode::I2c => Capability::I2c,
            PinMode::Spi => Capability::Spi,
        }
    }

    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            PinMode::Digital => "digital",
            PinMode::AnalogIn => "analog_in",
            PinMode::AnalogOut => "analog_out",
            PinMode::I2c => "i2c",
            PinMode::Spi => "spi",
        }
    }

    /// Parses a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "digital" => Some(PinMode::Digital),
            "analog_in" => Some(PinMode::AnalogIn),
            "analog_out" => Some(PinMode::AnalogOut),
            "i2c" => Some(PinMode::I2c),
            "spi" => Some(PinMode::Spi),
            _ => None,
        }
    }
}

/// Digital pin direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// Input pull resistor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    #[default]
    None,
    Up,
    Down,
}

impl Pull {
    /// Name used on the wire
    pub fn name(self) -> &'static str {
        match self {
            Pull::None => "none",
            Pull::Up => "up",
            Pull::Down => "down",
        }
    }

    /// Parses a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Pull::None),
            "up" => Some(Pull::Up),
            "down" => Some(Pull::Down),
            _ => None,
        }
    }
}

/// Output drive mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    #[default]
    PushPull,
    OpenDrain,
}

/// A raw analog reading at the converter's native resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogSample {
    pub raw: u32,
    pub bits: u8,
}

impl AnalogSample {
    /// Scales the reading to the full 16-bit range
    ///
    /// Full scale at the native resolution maps to `u16::MAX` and zero maps
    /// to zero. Readings above full scale clamp.
    pub fn to_u16(self) -> u16 {
        if self.bits == 0 {
            return 0;
        }
        let bits = u32::from(self.bits.min(32));
        let max = if bits == 32 {
            u64::from(u32::MAX)
        } else {
            (1u64 << bits) - 1
        };
        let raw = u64::from(self.raw).min(max);
        ((raw * u64::from(u16::MAX) + max / 2) / max) as u16
    }
}

/// Opaque token a provider returns for an open bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusToken(pub u32);

impl fmt::Display for BusToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus({})", self.0)
    }
}

/// I2C bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct I2cConfig {
    /// Clock frequency in Hz
    pub frequency: u32,
}

impl I2cConfig {
    /// Standard mode (100 kHz)
    pub const STANDARD: Self = Self { frequency: 100_000 };

    /// Fast mode (400 kHz)
    pub const FAST: Self = Self { frequency: 400_000 };
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// SPI clock polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Polarity {
    /// Clock idles low (CPOL=0)
    #[default]
    IdleLow,
    /// Clock idles high (CPOL=1)
    IdleHigh,
}

/// SPI clock phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Data captured on first clock transition (CPHA=0)
    #[default]
    CaptureOnFirstTransition,
    /// Data captured on second clock transition (CPHA=1)
    CaptureOnSecondTransition,
}

/// SPI bus configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpiConfig {
    /// Clock frequency in Hz
    pub baudrate: u32,
    pub polarity: Polarity,
    pub phase: Phase,
    /// Bits per word
    pub bits: u8,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            baudrate: 100_000,
            polarity: Polarity::IdleLow,
            phase: Phase::CaptureOnFirstTransition,
            bits: 8,
        }
    }
}

/// Pins and settings for opening a bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusPins {
    I2c {
        scl: Pin,
        sda: Pin,
        config: I2cConfig,
    },
    Spi {
        clock: Pin,
        mosi: Option<Pin>,
        miso: Option<Pin>,
    },
}

impl BusPins {
    /// Capability the bus requires
    pub fn capability(&self) -> Capability {
        match self {
            BusPins::I2c { .. } => Capability::I2c,
            BusPins::Spi { .. } => Capability::Spi,
        }
    }

    /// Every pin the bus occupies
    pub fn pins(&self) -> Vec<&Pin> {
        match self {
            BusPins::I2c { scl, sda, .. } => vec![scl, sda],
            BusPins::Spi { clock, mosi, miso } => {
                let mut pins = vec![clock];
                pins.extend(mosi.iter());
                pins.extend(miso.iter());
                pins
            }
        }
    }
}

/// Hardware backend
///
/// Implementations can assume the context has already validated pins,
/// modes and capabilities before calling.
pub trait HalProvider {
    /// Provider name, for diagnostics
    fn name(&self) -> &str;

    /// Backend family
    fn kind(&self) -> ProviderKind;

    /// Capabilities this provider implements
    fn capabilities(&self) -> CapabilitySet;

    /// Prepares a pin for a role
    fn pin_configure(&mut self, pin: &Pin, mode: PinMode) -> Result<(), HalError> {
        let _ = pin;
        Err(HalError::unsupported(mode.capability(), self.name()))
    }

    /// Returns a pin to its reset state
    fn pin_deinit(&mut self, pin: &Pin) -> Result<(), HalError> {
        let _ = pin;
        Ok(())
    }

    /// Makes a pin an output driving `initial`
    fn digital_switch_to_output(
        &mut self,
        pin: &Pin,
        initial: bool,
        drive: DriveMode,
    ) -> Result<(), HalError> {
        let _ = (pin, initial, drive);
        Err(HalError::unsupported(Capability::DigitalIo, self.name()))
    }

    /// Makes a pin an input with the given pull
    fn digital_switch_to_input(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        let _ = (pin, pull);
        Err(HalError::unsupported(Capability::DigitalIo, self.name()))
    }

    /// Changes the pull of an input pin
    fn digital_set_pull(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        let _ = (pin, pull);
        Err(HalError::unsupported(Capability::DigitalIo, self.name()))
    }

    /// Drives an output pin
    fn digital_write(&mut self, pin: &Pin, value: bool) -> Result<(), HalError> {
        let _ = (pin, value);
        Err(HalError::unsupported(Capability::DigitalIo, self.name()))
    }

    /// Samples an input pin
    fn digital_read(&mut self, pin: &Pin) -> Result<bool, HalError> {
        let _ = pin;
        Err(HalError::unsupported(Capability::DigitalIo, self.name()))
    }

    /// Samples an analog input at native resolution
    fn analog_read(&mut self, pin: &Pin) -> Result<AnalogSample, HalError> {
        let _ = pin;
        Err(HalError::unsupported(Capability::AnalogIn, self.name()))
    }

    /// Sets an analog output, full 16-bit range
    fn analog_write(&mut self, pin: &Pin, value: u16) -> Result<(), HalError> {
        let _ = (pin, value);
        Err(HalError::unsupported(Capability::AnalogOut, self.name()))
    }

    /// Opens a bus on already-claimed pins
    fn bus_open(&mut self, pins: &BusPins) -> Result<BusToken, HalError> {
        Err(HalError::unsupported(pins.capability(), self.name()))
    }

    /// Closes a bus
    fn bus_close(&mut self, bus: BusToken) -> Result<(), HalError> {
        let _ = bus;
        Ok(())
    }

    /// Writes bytes to an I2C device
    fn i2c_write(&mut self, bus: BusToken, address: u8, data: &[u8]) -> Result<(), HalError> {
        let _ = (bus, address, data);
        Err(HalError::unsupported(Capability::I2c, self.name()))
    }

    /// Reads bytes from an I2C device
    fn i2c_read(&mut self, bus: BusToken, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let _ = (bus, address, buf);
        Err(HalError::unsupported(Capability::I2c, self.name()))
    }

    /// Writes then reads in one transaction (repeated start)
    fn i2c_write_read(
        &mut self,
        bus: BusToken,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), HalError> {
        let _ = (bus, address, write, read);
        Err(HalError::unsupported(Capability::I2c, self.name()))
    }

    /// Returns true if a device acknowledges the address
    fn i2c_probe(&mut self, bus: BusToken, address: u8) -> Result<bool, HalError> {
        let _ = (bus, address);
        Err(HalError::unsupported(Capability::I2c, self.name()))
    }

    /// Applies SPI settings
    fn spi_configure(&mut self, bus: BusToken, config: &SpiConfig) -> Result<(), HalError> {
        let _ = (bus, config);
        Err(HalError::unsupported(Capability::Spi, self.name()))
    }

    /// Full-duplex transfer; `read` and `write` have equal length
    fn spi_transfer(&mut self, bus: BusToken, write: &[u8], read: &mut [u8]) -> Result<(), HalError> {
        let _ = (bus, write, read);
        Err(HalError::unsupported(Capability::Spi, self.name()))
    }
}
