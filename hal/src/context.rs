//! # HAL context
//!
//! [`Hal`] owns the active provider and the claim table. Proxies never talk
//! to a provider directly: every operation goes through the context, which
//! enforces claim uniqueness, capability checks and pin mode rules before
//! forwarding. Scripts therefore see the same behavior on every backend.
//!
//! [`HalContext`] is the shared, single-threaded handle proxies hold. It is
//! passed explicitly to proxy constructors; there is no process-wide
//! provider.

use crate::board::BoardCatalog;
use crate::capability::{Capability, CapabilitySet};
use crate::error::HalError;
use crate::pin::Pin;
use crate::provider::{
    BusPins, BusToken, Direction, DriveMode, HalProvider, I2cConfig, PinMode, ProviderKind, Pull,
    SpiConfig,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Lowest and highest 7-bit addresses probed by a bus scan
const I2C_SCAN_RANGE: std::ops::RangeInclusive<u8> = 0x08..=0x77;

/// A claimed pin
///
/// Issued by [`Hal::claim`]. The handle is only a ticket; the mode state it
/// refers to lives in the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    id: u32,
    pin: Pin,
    mode: PinMode,
}

impl PeripheralHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn pin(&self) -> &Pin {
        &self.pin
    }

    pub fn mode(&self) -> PinMode {
        self.mode
    }
}

/// An open bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusHandle {
    id: u32,
    kind: Capability,
}

impl BusHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// `Capability::I2c` or `Capability::Spi`
    pub fn kind(&self) -> Capability {
        self.kind
    }
}

/// A value read from or written to a pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinValue {
    Digital(bool),
    /// Full 16-bit range regardless of converter resolution
    Analog(u16),
}

/// Mode state of a claimed pin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinState {
    pub direction: Direction,
    pub pull: Pull,
    pub drive: DriveMode,
    /// Last value driven on a digital output
    pub last_digital: bool,
    /// Last value written to an analog output
    pub last_analog: u16,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            pull: Pull::None,
            drive: DriveMode::PushPull,
            last_digital: false,
            last_analog: 0,
        }
    }
}

struct HandleRecord {
    pin: Pin,
    mode: PinMode,
    state: PinState,
}

struct BusRecord {
    token: BusToken,
    pins: BusPins,
    pin_handles: Vec<u32>,
    locked: bool,
}

/// Hardware context: active provider plus claim table
pub struct Hal {
    board: BoardCatalog,
    provider: Box<dyn HalProvider>,
    /// Physical pin number to owning handle id
    claims: HashMap<u16, u32>,
    handles: BTreeMap<u32, HandleRecord>,
    buses: BTreeMap<u32, BusRecord>,
    next_id: u32,
}

impl Hal {
    /// Creates a context over a board with the given provider
    pub fn new(board: BoardCatalog, provider: Box<dyn HalProvider>) -> Self {
        info!(
            board = board.board_id(),
            provider = provider.name(),
            "HAL initialized"
        );
        Self {
            board,
            provider,
            claims: HashMap::new(),
            handles: BTreeMap::new(),
            buses: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Wraps this context for sharing with proxies
    pub fn into_shared(self) -> HalContext {
        HalContext::new(self)
    }

    pub fn board(&self) -> &BoardCatalog {
        &self.board
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    /// Capabilities of the active provider
    pub fn capabilities(&self) -> CapabilitySet {
        self.provider.capabilities()
    }

    /// Number of live pin handles, bus pins included
    pub fn live_handles(&self) -> usize {
        self.handles.len()
    }

    /// Number of open buses
    pub fn open_buses(&self) -> usize {
        self.buses.len()
    }

    /// Returns true if the named pin, or any alias of it, is claimed
    pub fn is_claimed(&self, name: &str) -> bool {
        self.board
            .get(name)
            .map(|pin| self.claims.contains_key(&pin.number))
            .unwrap_or(false)
    }

    /// Replaces the active provider
    ///
    /// Only allowed while nothing is claimed. Returns the previous provider.
    pub fn set_provider(
        &mut self,
        provider: Box<dyn HalProvider>,
    ) -> Result<Box<dyn HalProvider>, HalError> {
        if !self.handles.is_empty() {
            return Err(HalError::ProviderBusy {
                live: self.handles.len(),
            });
        }
        info!(
            from = self.provider.name(),
            to = provider.name(),
            "HAL provider replaced"
        );
        Ok(std::mem::replace(&mut self.provider, provider))
    }

    /// Claims a pin for a role
    ///
    /// Fails with `UnknownPin`, `CapabilityUnsupported` (pin or provider
    /// cannot serve the role) or `PinInUse`. A digital pin starts as an
    /// input with no pull.
    pub fn claim(&mut self, name: &str, mode: PinMode) -> Result<PeripheralHandle, HalError> {
        let pin = self.board.require(name)?.clone();
        self.check_capability(&pin, mode.capability())?;
        self.check_free(&pin)?;

        self.provider.pin_configure(&pin, mode)?;
        if mode == PinMode::Digital {
            if let Err(err) = self.provider.digital_switch_to_input(&pin, Pull::None) {
                let _ = self.provider.pin_deinit(&pin);
                return Err(err);
            }
        }

        let id = self.insert_handle(pin.clone(), mode);
        debug!(pin = %pin.name, mode = mode.name(), handle = id, "pin claimed");
        Ok(PeripheralHandle { id, pin, mode })
    }

    /// Releases a claimed pin
    ///
    /// The pin is immediately claimable again. Pins owned by a bus are
    /// released through [`Hal::close_bus`].
    pub fn release(&mut self, handle: &PeripheralHandle) -> Result<(), HalError> {
        if self
            .buses
            .values()
            .any(|bus| bus.pin_handles.contains(&handle.id))
        {
            return Err(HalError::InvalidMode(format!(
                "pin {} belongs to an open bus",
                handle.pin.name
            )));
        }
        self.release_id(handle.id)
    }

    /// Current mode state of a claimed pin
    pub fn state(&self, handle: &PeripheralHandle) -> Result<PinState, HalError> {
        Ok(self.record(handle)?.state)
    }

    /// Makes a digital pin an output, driving `initial`
    pub fn switch_to_output(
        &mut self,
        handle: &PeripheralHandle,
        initial: bool,
        drive: DriveMode,
    ) -> Result<(), HalError> {
        let pin = self.digital_pin(handle)?;
        self.provider.digital_switch_to_output(&pin, initial, drive)?;
        let state = &mut self.record_mut(handle)?.state;
        state.direction = Direction::Output;
        state.drive = drive;
        state.pull = Pull::None;
        state.last_digital = initial;
        Ok(())
    }

    /// Makes a digital pin an input with the given pull
    pub fn switch_to_input(&mut self, handle: &PeripheralHandle, pull: Pull) -> Result<(), HalError> {
        let pin = self.digital_pin(handle)?;
        self.provider.digital_switch_to_input(&pin, pull)?;
        let state = &mut self.record_mut(handle)?.state;
        state.direction = Direction::Input;
        state.pull = pull;
        Ok(())
    }

    /// Changes the pull of a digital input
    pub fn set_pull(&mut self, handle: &PeripheralHandle, pull: Pull) -> Result<(), HalError> {
        let pin = self.digital_pin(handle)?;
        if self.record(handle)?.state.direction == Direction::Output {
            return Err(HalError::InvalidMode(
                "pull can only be set on an input".to_string(),
            ));
        }
        self.provider.digital_set_pull(&pin, pull)?;
        self.record_mut(handle)?.state.pull = pull;
        Ok(())
    }

    /// Changes the drive mode of a digital output
    pub fn set_drive_mode(
        &mut self,
        handle: &PeripheralHandle,
        drive: DriveMode,
    ) -> Result<(), HalError> {
        let pin = self.digital_pin(handle)?;
        let state = self.record(handle)?.state;
        if state.direction == Direction::Input {
            return Err(HalError::InvalidMode(
                "drive mode can only be set on an output".to_string(),
            ));
        }
        self.provider
            .digital_switch_to_output(&pin, state.last_digital, drive)?;
        self.record_mut(handle)?.state.drive = drive;
        Ok(())
    }

    /// Reads a pin
    ///
    /// A digital output reads back the last value written. Analog inputs
    /// are scaled to the full 16-bit range.
    pub fn read(&mut self, handle: &PeripheralHandle) -> Result<PinValue, HalError> {
        let record = self.record(handle)?;
        let pin = record.pin.clone();
        match record.mode {
            PinMode::Digital => {
                if record.state.direction == Direction::Output {
                    Ok(PinValue::Digital(record.state.last_digital))
                } else {
                    Ok(PinValue::Digital(self.provider.digital_read(&pin)?))
                }
            }
            PinMode::AnalogIn => {
                let sample = self.provider.analog_read(&pin)?;
                Ok(PinValue::Analog(sample.to_u16()))
            }
            PinMode::AnalogOut => Ok(PinValue::Analog(record.state.last_analog)),
            PinMode::I2c | PinMode::Spi => Err(HalError::InvalidMode(format!(
                "pin {} is a bus pin",
                pin.name
            ))),
        }
    }

    /// Writes a pin
    pub fn write(&mut self, handle: &PeripheralHandle, value: PinValue) -> Result<(), HalError> {
        let record = self.record(handle)?;
        let pin = record.pin.clone();
        match (record.mode, value) {
            (PinMode::Digital, PinValue::Digital(level)) => {
                if record.state.direction == Direction::Input {
                    return Err(HalError::InvalidMode(
                        "cannot set value when direction is input".to_string(),
                    ));
                }
                self.provider.digital_write(&pin, level)?;
                self.record_mut(handle)?.state.last_digital = level;
                Ok(())
            }
            (PinMode::AnalogOut, PinValue::Analog(level)) => {
                self.provider.analog_write(&pin, level)?;
                self.record_mut(handle)?.state.last_analog = level;
                Ok(())
            }
            (PinMode::AnalogIn, _) => Err(HalError::InvalidMode(
                "analog input is read-only".to_string(),
            )),
            (PinMode::I2c | PinMode::Spi, _) => Err(HalError::InvalidMode(format!(
                "pin {} is a bus pin",
                pin.name
            ))),
            (mode, value) => Err(HalError::InvalidArgument(format!(
                "{:?} cannot be written to a {} pin",
                value,
                mode.name()
            ))),
        }
    }

    /// Opens an I2C bus
    pub fn open_i2c(&mut self, scl: &str, sda: &str, config: I2cConfig) -> Result<BusHandle, HalError> {
        let pins = BusPins::I2c {
            scl: self.board.require(scl)?.clone(),
            sda: self.board.require(sda)?.clone(),
            config,
        };
        self.open_bus(pins)
    }

    /// Opens an SPI bus; either data line may be absent
    pub fn open_spi(
        &mut self,
        clock: &str,
        mosi: Option<&str>,
        miso: Option<&str>,
    ) -> Result<BusHandle, HalError> {
        let lookup = |name: Option<&str>| -> Result<Option<Pin>, HalError> {
            name.map(|n| self.board.require(n).cloned()).transpose()
        };
        let pins = BusPins::Spi {
            clock: self.board.require(clock)?.clone(),
            mosi: lookup(mosi)?,
            miso: lookup(miso)?,
        };
        self.open_bus(pins)
    }

    /// Opens a bus, claiming all of its pins or none
    pub fn open_bus(&mut self, pins: BusPins) -> Result<BusHandle, HalError> {
        let capability = pins.capability();
        let members: Vec<Pin> = pins.pins().into_iter().cloned().collect();
        for (i, pin) in members.iter().enumerate() {
            self.check_capability(pin, capability)?;
            self.check_free(pin)?;
            if members[..i].iter().any(|other| other.aliases(pin)) {
                return Err(HalError::PinInUse {
                    pin: pin.name.clone(),
                    claimed_as: "same bus".to_string(),
                });
            }
        }

        let mode = match capability {
            Capability::I2c => PinMode::I2c,
            _ => PinMode::Spi,
        };
        let mut configured = Vec::new();
        for pin in &members {
            if let Err(err) = self.provider.pin_configure(pin, mode) {
                for done in &configured {
                    let _ = self.provider.pin_deinit(done);
                }
                return Err(err);
            }
            configured.push(pin.clone());
        }
        let token = match self.provider.bus_open(&pins) {
            Ok(token) => token,
            Err(err) => {
                for done in &configured {
                    let _ = self.provider.pin_deinit(done);
                }
                return Err(err);
            }
        };

        let pin_handles = members
            .into_iter()
            .map(|pin| self.insert_handle(pin, mode))
            .collect();
        let id = self.next_id();
        self.buses.insert(
            id,
            BusRecord {
                token,
                pins,
                pin_handles,
                locked: false,
            },
        );
        debug!(bus = id, kind = %capability, %token, "bus opened");
        Ok(BusHandle {
            id,
            kind: capability,
        })
    }

    /// Closes a bus and releases its pins
    pub fn close_bus(&mut self, bus: &BusHandle) -> Result<(), HalError> {
        let record = self
            .buses
            .remove(&bus.id)
            .ok_or(HalError::InvalidHandle(bus.id))?;
        let mut result = self.provider.bus_close(record.token);
        for id in record.pin_handles {
            let released = self.release_id(id);
            if result.is_ok() {
                result = released;
            }
        }
        debug!(bus = bus.id, "bus closed");
        result
    }

    /// Takes the bus lock if it is free
    pub fn bus_try_lock(&mut self, bus: &BusHandle) -> Result<bool, HalError> {
        let record = self.bus_mut(bus)?;
        if record.locked {
            return Ok(false);
        }
        record.locked = true;
        Ok(true)
    }

    /// Releases the bus lock
    pub fn bus_unlock(&mut self, bus: &BusHandle) -> Result<(), HalError> {
        self.bus_mut(bus)?.locked = false;
        Ok(())
    }

    /// Returns true if the bus lock is held
    pub fn bus_locked(&self, bus: &BusHandle) -> Result<bool, HalError> {
        self.buses
            .get(&bus.id)
            .map(|record| record.locked)
            .ok_or(HalError::InvalidHandle(bus.id))
    }

    /// Writes to an I2C device
    pub fn i2c_write(&mut self, bus: &BusHandle, address: u8, data: &[u8]) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::I2c)?;
        check_address(address)?;
        self.provider.i2c_write(token, address, data)
    }

    /// Reads from an I2C device
    pub fn i2c_read(&mut self, bus: &BusHandle, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::I2c)?;
        check_address(address)?;
        self.provider.i2c_read(token, address, buf)
    }

    /// Writes then reads in one transaction
    pub fn i2c_write_read(
        &mut self,
        bus: &BusHandle,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::I2c)?;
        check_address(address)?;
        self.provider.i2c_write_read(token, address, write, read)
    }

    /// Addresses that acknowledge, in ascending order
    pub fn i2c_scan(&mut self, bus: &BusHandle) -> Result<Vec<u8>, HalError> {
        let token = self.locked_bus(bus, Capability::I2c)?;
        let mut found = Vec::new();
        for address in I2C_SCAN_RANGE {
            if self.provider.i2c_probe(token, address)? {
                found.push(address);
            }
        }
        Ok(found)
    }

    /// Returns true if a device acknowledges `address`
    pub fn i2c_probe(&mut self, bus: &BusHandle, address: u8) -> Result<bool, HalError> {
        let token = self.locked_bus(bus, Capability::I2c)?;
        check_address(address)?;
        self.provider.i2c_probe(token, address)
    }

    /// Applies SPI settings
    pub fn spi_configure(&mut self, bus: &BusHandle, config: &SpiConfig) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::Spi)?;
        if config.bits != 8 && config.bits != 9 {
            return Err(HalError::InvalidArgument(format!(
                "unsupported word size: {} bits",
                config.bits
            )));
        }
        self.provider.spi_configure(token, config)
    }

    /// Writes bytes, discarding what is clocked in
    pub fn spi_write(&mut self, bus: &BusHandle, data: &[u8]) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::Spi)?;
        self.require_spi_line(bus, true)?;
        let mut sink = vec![0u8; data.len()];
        self.provider.spi_transfer(token, data, &mut sink)
    }

    /// Reads into `buf` while clocking out `write_value`
    pub fn spi_readinto(
        &mut self,
        bus: &BusHandle,
        buf: &mut [u8],
        write_value: u8,
    ) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::Spi)?;
        self.require_spi_line(bus, false)?;
        let out = vec![write_value; buf.len()];
        self.provider.spi_transfer(token, &out, buf)
    }

    /// Full-duplex transfer; buffers must have equal length
    pub fn spi_write_readinto(
        &mut self,
        bus: &BusHandle,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), HalError> {
        let token = self.locked_bus(bus, Capability::Spi)?;
        if write.len() != read.len() {
            return Err(HalError::InvalidArgument(
                "buffers must have the same length".to_string(),
            ));
        }
        self.require_spi_line(bus, true)?;
        self.require_spi_line(bus, false)?;
        self.provider.spi_transfer(token, write, read)
    }

    /// Releases every claim and closes every bus
    ///
    /// Backend failures are logged and do not stop the reset.
    pub fn reset(&mut self) {
        let buses: Vec<u32> = self.buses.keys().copied().collect();
        for id in buses {
            let bus = BusHandle {
                id,
                kind: Capability::I2c,
            };
            if let Err(err) = self.close_bus(&bus) {
                warn!(bus = id, error = %err, "bus close failed during reset");
            }
        }
        let handles: Vec<u32> = self.handles.keys().copied().collect();
        for id in handles {
            if let Err(err) = self.release_id(id) {
                warn!(handle = id, error = %err, "release failed during reset");
            }
        }
        debug!("HAL reset");
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn insert_handle(&mut self, pin: Pin, mode: PinMode) -> u32 {
        let id = self.next_id();
        self.claims.insert(pin.number, id);
        self.handles.insert(
            id,
            HandleRecord {
                pin,
                mode,
                state: PinState::default(),
            },
        );
        id
    }

    fn release_id(&mut self, id: u32) -> Result<(), HalError> {
        let record = self.handles.remove(&id).ok_or(HalError::InvalidHandle(id))?;
        self.claims.remove(&record.pin.number);
        debug!(pin = %record.pin.name, handle = id, "pin released");
        self.provider.pin_deinit(&record.pin)
    }

    fn check_capability(&self, pin: &Pin, capability: Capability) -> Result<(), HalError> {
        if !pin.supports(capability) {
            return Err(HalError::unsupported(capability, pin.name.clone()));
        }
        if !self.provider.capabilities().contains(capability) {
            return Err(HalError::unsupported(capability, self.provider.name()));
        }
        Ok(())
    }

    fn check_free(&self, pin: &Pin) -> Result<(), HalError> {
        match self.claims.get(&pin.number) {
            Some(id) => {
                let claimed_as = self
                    .handles
                    .get(id)
                    .map(|record| record.pin.name.clone())
                    .unwrap_or_default();
                Err(HalError::PinInUse {
                    pin: pin.name.clone(),
                    claimed_as,
                })
            }
            None => Ok(()),
        }
    }

    fn record(&self, handle: &PeripheralHandle) -> Result<&HandleRecord, HalError> {
        self.handles
            .get(&handle.id)
            .ok_or(HalError::InvalidHandle(handle.id))
    }

    fn record_mut(&mut self, handle: &PeripheralHandle) -> Result<&mut HandleRecord, HalError> {
        self.handles
            .get_mut(&handle.id)
            .ok_or(HalError::InvalidHandle(handle.id))
    }

    fn digital_pin(&self, handle: &PeripheralHandle) -> Result<Pin, HalError> {
        let record = self.record(handle)?;
        if record.mode != PinMode::Digital {
            return Err(HalError::InvalidMode(format!(
                "pin {} is not a digital pin",
                record.pin.name
            )));
        }
        Ok(record.pin.clone())
    }

    fn bus_mut(&mut self, bus: &BusHandle) -> Result<&mut BusRecord, HalError> {
        self.buses
            .get_mut(&bus.id)
            .ok_or(HalError::InvalidHandle(bus.id))
    }

    fn locked_bus(&self, bus: &BusHandle, kind: Capability) -> Result<BusToken, HalError> {
        let record = self
            .buses
            .get(&bus.id)
            .ok_or(HalError::InvalidHandle(bus.id))?;
        if record.pins.capability() != kind {
            return Err(HalError::InvalidMode(format!("bus {} is not {}", bus.id, kind)));
        }
        if !record.locked {
            return Err(HalError::BusNotLocked);
        }
        Ok(record.token)
    }

    fn require_spi_line(&self, bus: &BusHandle, mosi: bool) -> Result<(), HalError> {
        let record = self
            .buses
            .get(&bus.id)
            .ok_or(HalError::InvalidHandle(bus.id))?;
        match &record.pins {
            BusPins::Spi { mosi: Some(_), .. } if mosi => Ok(()),
            BusPins::Spi { miso: Some(_), .. } if !mosi => Ok(()),
            _ => Err(HalError::InvalidMode(format!(
                "no {} pin",
                if mosi { "MOSI" } else { "MISO" }
            ))),
        }
    }
}

fn check_address(address: u8) -> Result<(), HalError> {
    if address > 0x7f {
        return Err(HalError::InvalidArgument(format!(
            "address {:#x} is not a 7-bit address",
            address
        )));
    }
    Ok(())
}

/// Shared handle to a [`Hal`]
///
/// Single-threaded: the host runtime drives everything from one thread.
#[derive(Clone)]
pub struct HalContext {
    inner: Rc<RefCell<Hal>>,
}

impl HalContext {
    pub fn new(hal: Hal) -> Self {
        Self {
            inner: Rc::new(RefCell::new(hal)),
        }
    }

    /// Runs `f` with exclusive access to the context
    pub fn with<R>(&self, f: impl FnOnce(&mut Hal) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Like [`HalContext::with`], but returns `None` if the context is
    /// already borrowed
    pub fn try_with<R>(&self, f: impl FnOnce(&mut Hal) -> R) -> Option<R> {
        self.inner.try_borrow_mut().ok().map(|mut hal| f(&mut hal))
    }

    pub fn live_handles(&self) -> usize {
        self.inner.borrow().live_handles()
    }

    pub fn is_claimed(&self, name: &str) -> bool {
        self.inner.borrow().is_claimed(name)
    }

    pub fn set_provider(
        &self,
        provider: Box<dyn HalProvider>,
    ) -> Result<Box<dyn HalProvider>, HalError> {
        self.with(|hal| hal.set_provider(provider))
    }

    pub fn reset(&self) {
        self.with(Hal::reset)
    }
}
