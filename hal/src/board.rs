//! # Board catalog
//!
//! The set of pins a board exposes, looked up by name. Insertion order is
//! preserved so that exported descriptions and listings are stable.

use crate::capability::{Capability, CapabilitySet};
use crate::error::HalError;
use crate::pin::Pin;
use serde::Serialize;
use std::collections::HashMap;

/// Named pins of one board
#[derive(Debug, Clone)]
pub struct BoardCatalog {
    board_id: String,
    pins: Vec<Pin>,
    by_name: HashMap<String, usize>,
}

#[derive(Serialize)]
struct BoardExport<'a> {
    board: &'a str,
    pins: &'a [Pin],
}

impl BoardCatalog {
    /// Creates an empty catalog
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            pins: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Adds a pin, replacing any previous pin with the same name
    pub fn add_pin(&mut self, pin: Pin) {
        match self.by_name.get(&pin.name) {
            Some(&index) => self.pins[index] = pin,
            None => {
                self.by_name.insert(pin.name.clone(), self.pins.len());
                self.pins.push(pin);
            }
        }
    }

    /// Builder form of [`BoardCatalog::add_pin`]
    pub fn with_pin(mut self, pin: Pin) -> Self {
        self.add_pin(pin);
        self
    }

    /// Board identifier
    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    /// Looks up a pin by name
    pub fn get(&self, name: &str) -> Option<&Pin> {
        self.by_name.get(name).map(|&index| &self.pins[index])
    }

    /// Looks up a pin by name, failing with [`HalError::UnknownPin`]
    pub fn require(&self, name: &str) -> Result<&Pin, HalError> {
        self.get(name).ok_or_else(|| HalError::UnknownPin {
            name: name.to_string(),
        })
    }

    /// All names that refer to the given physical pin
    pub fn aliases_of(&self, number: u16) -> impl Iterator<Item = &Pin> {
        self.pins.iter().filter(move |pin| pin.number == number)
    }

    /// Pins in insertion order
    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    /// Number of named pins
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// Returns true if the catalog has no pins
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Exports the catalog as JSON
    pub fn to_json(&self) -> Result<String, HalError> {
        let export = BoardExport {
            board: &self.board_id,
            pins: &self.pins,
        };
        serde_json::to_string(&export).map_err(|err| HalError::Backend(err.to_string()))
    }

    /// A built-in catalog by board id
    pub fn builtin(board_id: &str) -> Option<Self> {
        match board_id {
            "generic_metro" => Some(Self::generic_metro()),
            _ => None,
        }
    }

    /// The generic Metro-style board
    ///
    /// Arduino Uno pinout: D0-D13, A0-A5 (also reachable as D14-D19), an
    /// on-board LED sharing D13, a button, a NeoPixel, and named bus pins
    /// that alias the numbered ones.
    pub fn generic_metro() -> Self {
        use Capability::*;

        const DIGITAL: CapabilitySet = CapabilitySet::of(&[DigitalIo]);
        const DIGITAL_PWM: CapabilitySet = CapabilitySet::of(&[DigitalIo, Pwm]);
        const DIGITAL_UART: CapabilitySet = CapabilitySet::of(&[DigitalIo, Uart]);
        const DIGITAL_SPI: CapabilitySet = CapabilitySet::of(&[DigitalIo, Spi]);
        const DIGITAL_PWM_SPI: CapabilitySet = CapabilitySet::of(&[DigitalIo, Pwm, Spi]);
        const ANALOG: CapabilitySet = CapabilitySet::of(&[DigitalIo, AnalogIn]);
        const ANALOG_DAC: CapabilitySet = CapabilitySet::of(&[DigitalIo, AnalogIn, AnalogOut]);
        const ANALOG_I2C: CapabilitySet = CapabilitySet::of(&[DigitalIo, AnalogIn, I2c]);
        const DIGITAL_I2C: CapabilitySet = CapabilitySet::of(&[DigitalIo, I2c]);

        let table: [(&str, u16, CapabilitySet); 36] = [
            ("D0", 0, DIGITAL_UART),
            ("D1", 1, DIGITAL_UART),
            ("D2", 2, DIGITAL),
            ("D3", 3, DIGITAL_PWM),
            ("D4", 4, DIGITAL),
            ("D5", 5, DIGITAL_PWM),
            ("D6", 6, DIGITAL_PWM),
            ("D7", 7, DIGITAL),
            ("D8", 8, DIGITAL),
            ("D9", 9, DIGITAL_PWM),
            ("D10", 10, DIGITAL_PWM_SPI),
            ("D11", 11, DIGITAL_PWM_SPI),
            ("D12", 12, DIGITAL_SPI),
            ("D13", 13, DIGITAL_SPI),
            ("A0", 14, ANALOG_DAC),
            ("A1", 15, ANALOG),
            ("A2", 16, ANALOG),
            ("A3", 17, ANALOG),
            ("A4", 18, ANALOG_I2C),
            ("A5", 19, ANALOG_I2C),
            ("D14", 14, ANALOG_DAC),
            ("D15", 15, ANALOG),
            ("D16", 16, ANALOG),
            ("D17", 17, ANALOG),
            ("D18", 18, ANALOG_I2C),
            ("D19", 19, ANALOG_I2C),
            ("LED", 13, DIGITAL),
            ("BUTTON", 20, DIGITAL),
            ("NEOPIXEL", 21, DIGITAL),
            ("SDA", 18, DIGITAL_I2C),
            ("SCL", 19, DIGITAL_I2C),
            ("MOSI", 11, DIGITAL_SPI),
            ("MISO", 12, DIGITAL_SPI),
            ("SCK", 13, DIGITAL_SPI),
            ("TX", 1, DIGITAL_UART),
            ("RX", 0, DIGITAL_UART),
        ];

        let mut catalog = BoardCatalog::new("generic_metro");
        for (name, number, caps) in table {
            catalog.add_pin(Pin::new(name, number, format!("PA{:02}", number), caps));
        }
        catalog
    }
}

impl Default for BoardCatalog {
    fn default() -> Self {
        Self::generic_metro()
    }
}
