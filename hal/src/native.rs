//! # Native provider
//!
//! [`NativeProvider`] drives [`VirtualPeripherals`], an in-memory model of
//! the board: pin levels with write history, a 12-bit ADC, DAC outputs,
//! I2C devices with register files and an SPI loopback.
//!
//! The model is shared through a [`PeripheralsHandle`] so tests (and the
//! simulated host) can stimulate inputs and inspect outputs while the
//! provider is owned by a [`Hal`](crate::Hal).

use crate::capability::{Capability, CapabilitySet};
use crate::error::HalError;
use crate::pin::Pin;
use crate::provider::{
    AnalogSample, BusPins, BusToken, Direction, DriveMode, HalProvider, PinMode, ProviderKind,
    Pull, SpiConfig,
};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Default ADC resolution
pub const DEFAULT_ADC_BITS: u8 = 12;

/// Shared handle to a peripheral model
pub type PeripheralsHandle = Rc<RefCell<VirtualPeripherals>>;

/// State of one physical pin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualPin {
    pub mode: Option<PinMode>,
    pub direction: Option<Direction>,
    pub pull: Pull,
    pub drive: DriveMode,
    /// Level driven by the pin when it is an output
    pub level: bool,
    /// Level driven onto the pin from outside
    pub external: Option<bool>,
    pub analog_raw: Option<u32>,
    pub analog_out: u16,
    /// Every digital write, in order
    pub writes: Vec<bool>,
}

/// A register-file I2C device
///
/// The first byte of a write sets the register pointer; further bytes are
/// stored from there on. Reads continue from the pointer.
#[derive(Debug, Clone)]
pub struct I2cDevice {
    registers: [u8; 256],
    pointer: u8,
}

impl Default for I2cDevice {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
        }
    }
}

impl I2cDevice {
    fn write(&mut self, data: &[u8]) {
        if let Some((&first, rest)) = data.split_first() {
            self.pointer = first;
            for &byte in rest {
                self.registers[usize::from(self.pointer)] = byte;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.registers[usize::from(self.pointer)];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

#[derive(Debug, Clone)]
struct VirtualBus {
    pins: BusPins,
    spi: SpiConfig,
}

/// In-memory board model
#[derive(Debug)]
pub struct VirtualPeripherals {
    pins: BTreeMap<u16, VirtualPin>,
    adc_bits: u8,
    i2c_devices: BTreeMap<u8, I2cDevice>,
    buses: BTreeMap<u32, VirtualBus>,
    next_bus: u32,
    spi_sent: Vec<u8>,
}

impl Default for VirtualPeripherals {
    fn default() -> Self {
        Self::new(DEFAULT_ADC_BITS)
    }
}

impl VirtualPeripherals {
    pub fn new(adc_bits: u8) -> Self {
        Self {
            pins: BTreeMap::new(),
            adc_bits,
            i2c_devices: BTreeMap::new(),
            buses: BTreeMap::new(),
            next_bus: 1,
            spi_sent: Vec::new(),
        }
    }

    /// Wraps the model for sharing
    pub fn shared(self) -> PeripheralsHandle {
        Rc::new(RefCell::new(self))
    }

    pub fn adc_bits(&self) -> u8 {
        self.adc_bits
    }

    /// State of a physical pin, if it was ever touched
    pub fn pin(&self, pin: &Pin) -> Option<&VirtualPin> {
        self.pins.get(&pin.number)
    }

    fn entry(&mut self, pin: &Pin) -> &mut VirtualPin {
        self.pins.entry(pin.number).or_default()
    }

    pub fn configure(&mut self, pin: &Pin, mode: PinMode) {
        self.entry(pin).mode = Some(mode);
    }

    /// Returns the pin to reset state, keeping stimulus and write history
    pub fn deinit(&mut self, pin: &Pin) {
        let state = self.entry(pin);
        state.mode = None;
        state.direction = None;
        state.pull = Pull::None;
        state.drive = DriveMode::PushPull;
        state.level = false;
    }

    pub fn switch_to_output(&mut self, pin: &Pin, initial: bool, drive: DriveMode) {
        let state = self.entry(pin);
        state.direction = Some(Direction::Output);
        state.drive = drive;
        state.pull = Pull::None;
        state.level = initial;
    }

    pub fn switch_to_input(&mut self, pin: &Pin, pull: Pull) {
        let state = self.entry(pin);
        state.direction = Some(Direction::Input);
        state.pull = pull;
    }

    pub fn set_pull(&mut self, pin: &Pin, pull: Pull) {
        self.entry(pin).pull = pull;
    }

    pub fn write(&mut self, pin: &Pin, value: bool) {
        let state = self.entry(pin);
        state.level = value;
        state.writes.push(value);
    }

    /// Samples a pin
    ///
    /// Outputs read their own level. Inputs read the external drive, or the
    /// pull when nothing drives them.
    pub fn read(&mut self, pin: &Pin) -> bool {
        let state = self.entry(pin);
        if state.direction == Some(Direction::Output) {
            return state.level;
        }
        state.external.unwrap_or(state.pull == Pull::Up)
    }

    /// Drives an input from outside, or stops driving it with `None`
    pub fn drive_input(&mut self, pin: &Pin, level: Option<bool>) {
        self.entry(pin).external = level;
    }

    /// Every value written to the pin, in order
    pub fn write_history(&self, pin: &Pin) -> Vec<bool> {
        self.pin(pin).map(|state| state.writes.clone()).unwrap_or_default()
    }

    pub fn clear_history(&mut self) {
        for state in self.pins.values_mut() {
            state.writes.clear();
        }
        self.spi_sent.clear();
    }

    /// Sets the raw ADC reading of a pin, clamped to full scale
    pub fn set_analog_input(&mut self, pin: &Pin, raw: u32) {
        let max = self.adc_max();
        self.entry(pin).analog_raw = Some(raw.min(max));
    }

    /// Samples a pin; unset inputs read mid-scale
    pub fn analog_read(&mut self, pin: &Pin) -> AnalogSample {
        let bits = self.adc_bits;
        let mid = self.adc_max().div_ceil(2);
        let raw = self.entry(pin).analog_raw.unwrap_or(mid);
        AnalogSample { raw, bits }
    }

    pub fn analog_write(&mut self, pin: &Pin, value: u16) {
        self.entry(pin).analog_out = value;
    }

    pub fn analog_output(&self, pin: &Pin) -> u16 {
        self.pin(pin).map(|state| state.analog_out).unwrap_or(0)
    }

    fn adc_max(&self) -> u32 {
        match self.adc_bits {
            0 => 0,
            bits if bits >= 32 => u32::MAX,
            bits => (1u32 << bits) - 1,
        }
    }

    /// Attaches an I2C device at a 7-bit address
    pub fn add_i2c_device(&mut self, address: u8) {
        self.i2c_devices.entry(address).or_default();
    }

    /// Sets a register of an attached device
    pub fn set_register(&mut self, address: u8, register: u8, value: u8) -> Result<(), HalError> {
        let device = self.device(address)?;
        device.registers[usize::from(register)] = value;
        Ok(())
    }

    /// Reads a register of an attached device
    pub fn register(&self, address: u8, register: u8) -> Option<u8> {
        self.i2c_devices
            .get(&address)
            .map(|device| device.registers[usize::from(register)])
    }

    fn device(&mut self, address: u8) -> Result<&mut I2cDevice, HalError> {
        self.i2c_devices
            .get_mut(&address)
            .ok_or(HalError::NoDevice { address })
    }

    pub fn bus_open(&mut self, pins: &BusPins) -> BusToken {
        let id = self.next_bus;
        self.next_bus += 1;
        self.buses.insert(
            id,
            VirtualBus {
                pins: pins.clone(),
                spi: SpiConfig::default(),
            },
        );
        BusToken(id)
    }

    pub fn bus_close(&mut self, bus: BusToken) -> Result<(), HalError> {
        self.buses
            .remove(&bus.0)
            .map(|_| ())
            .ok_or(HalError::InvalidHandle(bus.0))
    }

    fn bus(&mut self, bus: BusToken) -> Result<&mut VirtualBus, HalError> {
        self.buses.get_mut(&bus.0).ok_or(HalError::InvalidHandle(bus.0))
    }

    pub fn i2c_write(&mut self, bus: BusToken, address: u8, data: &[u8]) -> Result<(), HalError> {
        self.bus(bus)?;
        self.device(address)?.write(data);
        Ok(())
    }

    pub fn i2c_read(&mut self, bus: BusToken, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        self.bus(bus)?;
        self.device(address)?.read(buf);
        Ok(())
    }

    pub fn i2c_probe(&mut self, bus: BusToken, address: u8) -> Result<bool, HalError> {
        self.bus(bus)?;
        Ok(self.i2c_devices.contains_key(&address))
    }

    pub fn spi_configure(&mut self, bus: BusToken, config: &SpiConfig) -> Result<(), HalError> {
        self.bus(bus)?.spi = *config;
        Ok(())
    }

    /// Current settings of an SPI bus
    pub fn spi_config(&self, bus: BusToken) -> Option<SpiConfig> {
        self.buses.get(&bus.0).map(|bus| bus.spi)
    }

    /// Loopback transfer: MISO reads back what MOSI sent
    ///
    /// With no MOSI line the bus clocks out the requested fill bytes but
    /// nothing reaches MISO, which then reads zeros.
    pub fn spi_transfer(&mut self, bus: BusToken, write: &[u8], read: &mut [u8]) -> Result<(), HalError> {
        let has_mosi = matches!(self.bus(bus)?.pins, BusPins::Spi { mosi: Some(_), .. });
        if has_mosi {
            self.spi_sent.extend_from_slice(write);
        }
        for (i, byte) in read.iter_mut().enumerate() {
            *byte = if has_mosi {
                write.get(i).copied().unwrap_or(0)
            } else {
                0
            };
        }
        Ok(())
    }

    /// Every byte sent on a MOSI line
    pub fn spi_sent(&self) -> &[u8] {
        &self.spi_sent
    }
}

/// Provider backed by the in-memory model
pub struct NativeProvider {
    peripherals: PeripheralsHandle,
    capabilities: CapabilitySet,
}

impl NativeProvider {
    /// Everything but UART
    pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
        Capability::DigitalIo,
        Capability::AnalogIn,
        Capability::AnalogOut,
        Capability::Pwm,
        Capability::I2c,
        Capability::Spi,
    ]);

    pub fn new() -> Self {
        Self::with_peripherals(VirtualPeripherals::default().shared())
    }

    /// Uses an existing model
    pub fn with_peripherals(peripherals: PeripheralsHandle) -> Self {
        Self {
            peripherals,
            capabilities: Self::CAPABILITIES,
        }
    }

    /// Restricts the declared capabilities
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Handle to the model, for stimulus and inspection
    pub fn peripherals(&self) -> PeripheralsHandle {
        Rc::clone(&self.peripherals)
    }
}

impl Default for NativeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HalProvider for NativeProvider {
    fn name(&self) -> &str {
        "native"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Native
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn pin_configure(&mut self, pin: &Pin, mode: PinMode) -> Result<(), HalError> {
        self.peripherals.borrow_mut().configure(pin, mode);
        Ok(())
    }

    fn pin_deinit(&mut self, pin: &Pin) -> Result<(), HalError> {
        self.peripherals.borrow_mut().deinit(pin);
        Ok(())
    }

    fn digital_switch_to_output(
        &mut self,
        pin: &Pin,
        initial: bool,
        drive: DriveMode,
    ) -> Result<(), HalError> {
        self.peripherals
            .borrow_mut()
            .switch_to_output(pin, initial, drive);
        Ok(())
    }

    fn digital_switch_to_input(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        self.peripherals.borrow_mut().switch_to_input(pin, pull);
        Ok(())
    }

    fn digital_set_pull(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        self.peripherals.borrow_mut().set_pull(pin, pull);
        Ok(())
    }

    fn digital_write(&mut self, pin: &Pin, value: bool) -> Result<(), HalError> {
        self.peripherals.borrow_mut().write(pin, value);
        Ok(())
    }

    fn digital_read(&mut self, pin: &Pin) -> Result<bool, HalError> {
        Ok(self.peripherals.borrow_mut().read(pin))
    }

    fn analog_read(&mut self, pin: &Pin) -> Result<AnalogSample, HalError> {
        Ok(self.peripherals.borrow_mut().analog_read(pin))
    }

    fn analog_write(&mut self, pin: &Pin, value: u16) -> Result<(), HalError> {
        self.peripherals.borrow_mut().analog_write(pin, value);
        Ok(())
    }

    fn bus_open(&mut self, pins: &BusPins) -> Result<BusToken, HalError> {
        Ok(self.peripherals.borrow_mut().bus_open(pins))
    }

    fn bus_close(&mut self, bus: BusToken) -> Result<(), HalError> {
        self.peripherals.borrow_mut().bus_close(bus)
    }

    fn i2c_write(&mut self, bus: BusToken, address: u8, data: &[u8]) -> Result<(), HalError> {
        self.peripherals.borrow_mut().i2c_write(bus, address, data)
    }

    fn i2c_read(&mut self, bus: BusToken, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        self.peripherals.borrow_mut().i2c_read(bus, address, buf)
    }

    fn i2c_write_read(
        &mut self,
        bus: BusToken,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), HalError> {
        let mut peripherals = self.peripherals.borrow_mut();
        peripherals.i2c_write(bus, address, write)?;
        peripherals.i2c_read(bus, address, read)
    }

    fn i2c_probe(&mut self, bus: BusToken, address: u8) -> Result<bool, HalError> {
        self.peripherals.borrow_mut().i2c_probe(bus, address)
    }

    fn spi_configure(&mut self, bus: BusToken, config: &SpiConfig) -> Result<(), HalError> {
        self.peripherals.borrow_mut().spi_configure(bus, config)
    }

    fn spi_transfer(&mut self, bus: BusToken, write: &[u8], read: &mut [u8]) -> Result<(), HalError> {
        self.peripherals.borrow_mut().spi_transfer(bus, write, read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(name: &str, number: u16) -> Pin {
        Pin::new(name, number, name, CapabilitySet::all())
    }

    #[test]
    fn test_output_history() {
        let mut hw = VirtualPeripherals::default();
        let led = pin("LED", 13);
        hw.switch_to_output(&led, false, DriveMode::PushPull);
        hw.write(&led, true);
        hw.write(&led, false);
        assert_eq!(hw.write_history(&led), vec![true, false]);
        assert!(!hw.read(&led));

        // aliases share state
        assert_eq!(hw.write_history(&pin("D13", 13)), vec![true, false]);
    }

    #[test]
    fn test_input_pull_and_drive() {
        let mut hw = VirtualPeripherals::default();
        let button = pin("BUTTON", 20);
        hw.switch_to_input(&button, Pull::Up);
        assert!(hw.read(&button));
        hw.drive_input(&button, Some(false));
        assert!(!hw.read(&button));
        hw.drive_input(&button, None);
        hw.set_pull(&button, Pull::Down);
        assert!(!hw.read(&button));
    }

    #[test]
    fn test_analog_defaults_to_midscale() {
        let mut hw = VirtualPeripherals::default();
        let a0 = pin("A0", 14);
        assert_eq!(hw.analog_read(&a0), AnalogSample { raw: 2048, bits: 12 });
        hw.set_analog_input(&a0, 100_000);
        assert_eq!(hw.analog_read(&a0).raw, 4095);
    }

    #[test]
    fn test_i2c_register_file() {
        let mut hw = VirtualPeripherals::default();
        let bus = hw.bus_open(&BusPins::I2c {
            scl: pin("SCL", 19),
            sda: pin("SDA", 18),
            config: Default::default(),
        });
        hw.add_i2c_device(0x48);
        hw.i2c_write(bus, 0x48, &[0x10, 0xAA, 0xBB]).unwrap();
        assert_eq!(hw.register(0x48, 0x11), Some(0xBB));

        hw.i2c_write(bus, 0x48, &[0x10]).unwrap();
        let mut buf = [0u8; 2];
        hw.i2c_read(bus, 0x48, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);

        assert_eq!(
            hw.i2c_write(bus, 0x50, &[0]),
            Err(HalError::NoDevice { address: 0x50 })
        );
        assert!(hw.i2c_probe(bus, 0x48).unwrap());
        assert!(!hw.i2c_probe(bus, 0x49).unwrap());
    }

    #[test]
    fn test_spi_loopback() {
        let mut hw = VirtualPeripherals::default();
        let bus = hw.bus_open(&BusPins::Spi {
            clock: pin("SCK", 13),
            mosi: Some(pin("MOSI", 11)),
            miso: Some(pin("MISO", 12)),
        });
        let mut read = [0u8; 3];
        hw.spi_transfer(bus, &[1, 2, 3], &mut read).unwrap();
        assert_eq!(read, [1, 2, 3]);
        assert_eq!(hw.spi_sent(), &[1, 2, 3]);
        hw.bus_close(bus).unwrap();
        assert_eq!(hw.bus_close(bus), Err(HalError::InvalidHandle(bus.0)));
    }

    #[test]
    fn test_provider_declares_capabilities() {
        let provider = NativeProvider::new();
        assert!(provider.capabilities().contains(Capability::I2c));
        assert!(!provider.capabilities().contains(Capability::Uart));
        assert_eq!(provider.kind(), ProviderKind::Native);
    }
}
