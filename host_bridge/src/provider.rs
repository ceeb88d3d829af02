//! # Host-bridged HAL provider
//!
//! Implements [`HalProvider`] by calling methods on the host's `hardware`
//! object through the bridge. All pin bookkeeping stays in the HAL
//! context; this provider only translates operations into host calls.
//!
//! | operation | host method |
//! |-----------|-------------|
//! | configure / deinit | `configurePin`, `releasePin` |
//! | digital | `switchToOutput`, `switchToInput`, `setPull`, `digitalWrite`, `digitalRead` |
//! | analog | `analogRead`, `analogWrite` |
//! | buses | `createI2C`, `createSPI`, then methods on the returned bus object |

use crate::bridge::SharedBridge;
use crate::error::ForeignCallError;
use crate::value::{ForeignRef, ForeignValue};
use hal::{
    AnalogSample, BusPins, BusToken, CapabilitySet, DriveMode, HalError, HalProvider, Phase, Pin,
    PinMode, Polarity, ProviderKind, Pull, SpiConfig,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

fn backend(err: ForeignCallError) -> HalError {
    HalError::Backend(err.to_string())
}

/// Drops a result nobody uses; a stray host object is released
fn discard(bridge: &SharedBridge, value: ForeignValue) {
    if let ForeignValue::Object(reference) = value {
        if let Err(err) = bridge.release(reference) {
            warn!(reference = reference.id(), error = %err, "release of unexpected object failed");
        }
    }
}

fn expect<T>(
    bridge: &SharedBridge,
    value: ForeignValue,
    expected: &'static str,
    extract: impl FnOnce(&ForeignValue) -> Option<T>,
) -> Result<T, ForeignCallError> {
    match extract(&value) {
        Some(extracted) => Ok(extracted),
        None => {
            let found = value.kind();
            discard(bridge, value);
            Err(ForeignCallError::TypeMismatch { expected, found })
        }
    }
}

/// HAL provider backed by the host runtime
pub struct HostBridgedProvider {
    bridge: SharedBridge,
    hardware: ForeignRef,
    capabilities: CapabilitySet,
    analog_bits: u8,
    buses: HashMap<BusToken, ForeignRef>,
    next_token: u32,
}

impl HostBridgedProvider {
    /// Looks up the host's `hardware` object and asks what it supports
    pub fn connect(bridge: SharedBridge) -> Result<Self, ForeignCallError> {
        let global = bridge.global();
        let hardware = expect(&bridge, bridge.call(global, "hardware", &[])?, "object", ForeignValue::as_object)?;
        let probed = bridge
            .call(hardware, "capabilities", &[])
            .and_then(|mask| expect(&bridge, mask, "integer", ForeignValue::as_int))
            .and_then(|mask| {
                let bits = bridge.call(hardware, "analogResolution", &[])?;
                Ok((mask, expect(&bridge, bits, "integer", ForeignValue::as_int)?))
            });
        let (mask, bits) = match probed {
            Ok(probed) => probed,
            Err(err) => {
                bridge.release(hardware)?;
                return Err(err);
            }
        };

        let capabilities = CapabilitySet::from_bits(u32::try_from(mask).unwrap_or(0));
        info!(capabilities = %capabilities, analog_bits = bits, "host hardware connected");
        Ok(Self {
            bridge,
            hardware,
            capabilities,
            analog_bits: bits.clamp(1, 32) as u8,
            buses: HashMap::new(),
            next_token: 1,
        })
    }

    /// The bridge this provider calls through
    pub fn bridge(&self) -> &SharedBridge {
        &self.bridge
    }

    /// Number of host bus objects currently held
    pub fn open_buses(&self) -> usize {
        self.buses.len()
    }

    fn hardware_call(&self, method: &str, args: &[ForeignValue]) -> Result<ForeignValue, HalError> {
        self.bridge.call(self.hardware, method, args).map_err(backend)
    }

    /// A hardware call whose result is ignored
    fn hardware_command(&self, method: &str, args: &[ForeignValue]) -> Result<(), HalError> {
        let value = self.hardware_call(method, args)?;
        discard(&self.bridge, value);
        Ok(())
    }

    fn expect<T>(
        &self,
        value: ForeignValue,
        expected: &'static str,
        extract: impl FnOnce(&ForeignValue) -> Option<T>,
    ) -> Result<T, HalError> {
        expect(&self.bridge, value, expected, extract).map_err(backend)
    }

    fn bus(&self, bus: BusToken) -> Result<ForeignRef, HalError> {
        self.buses.get(&bus).copied().ok_or(HalError::InvalidHandle(bus.0))
    }

    fn bus_call(&self, bus: BusToken, method: &str, args: &[ForeignValue]) -> Result<ForeignValue, HalError> {
        let reference = self.bus(bus)?;
        self.bridge.call(reference, method, args).map_err(backend)
    }

    /// Copies a returned buffer; `None` means nobody acknowledged
    fn read_buffer(&self, value: ForeignValue, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        match value {
            ForeignValue::None => Err(HalError::NoDevice { address }),
            ForeignValue::Bytes(bytes) if bytes.len() == buf.len() => {
                buf.copy_from_slice(&bytes);
                Ok(())
            }
            ForeignValue::Bytes(bytes) => Err(HalError::Backend(format!(
                "host returned {} bytes, expected {}",
                bytes.len(),
                buf.len()
            ))),
            other => {
                let found = other.kind();
                discard(&self.bridge, other);
                Err(backend(ForeignCallError::TypeMismatch {
                    expected: "buffer",
                    found,
                }))
            }
        }
    }
}

fn pin_name(pin: &Pin) -> ForeignValue {
    ForeignValue::from(pin.name.as_str())
}

impl HalProvider for HostBridgedProvider {
    fn name(&self) -> &str {
        "host"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::HostBridged
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn pin_configure(&mut self, pin: &Pin, mode: PinMode) -> Result<(), HalError> {
        self.hardware_command("configurePin", &[pin_name(pin), mode.name().into()])
    }

    fn pin_deinit(&mut self, pin: &Pin) -> Result<(), HalError> {
        self.hardware_command("releasePin", &[pin_name(pin)])
    }

    fn digital_switch_to_output(
        &mut self,
        pin: &Pin,
        initial: bool,
        drive: DriveMode,
    ) -> Result<(), HalError> {
        let open_drain = drive == DriveMode::OpenDrain;
        self.hardware_command(
            "switchToOutput",
            &[pin_name(pin), initial.into(), open_drain.into()],
        )
    }

    fn digital_switch_to_input(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        self.hardware_command("switchToInput", &[pin_name(pin), pull.name().into()])
    }

    fn digital_set_pull(&mut self, pin: &Pin, pull: Pull) -> Result<(), HalError> {
        self.hardware_command("setPull", &[pin_name(pin), pull.name().into()])
    }

    fn digital_write(&mut self, pin: &Pin, value: bool) -> Result<(), HalError> {
        self.hardware_command("digitalWrite", &[pin_name(pin), value.into()])
    }

    fn digital_read(&mut self, pin: &Pin) -> Result<bool, HalError> {
        let value = self.hardware_call("digitalRead", &[pin_name(pin)])?;
        self.expect(value, "bool", ForeignValue::as_bool)
    }

    fn analog_read(&mut self, pin: &Pin) -> Result<AnalogSample, HalError> {
        let value = self.hardware_call("analogRead", &[pin_name(pin)])?;
        let raw = self.expect(value, "integer", ForeignValue::as_int)?;
        Ok(AnalogSample {
            raw: raw.clamp(0, i64::from(u32::MAX)) as u32,
            bits: self.analog_bits,
        })
    }

    fn analog_write(&mut self, pin: &Pin, value: u16) -> Result<(), HalError> {
        self.hardware_command("analogWrite", &[pin_name(pin), u32::from(value).into()])
    }

    fn bus_open(&mut self, pins: &BusPins) -> Result<BusToken, HalError> {
        let created = match pins {
            BusPins::I2c { scl, sda, config } => self.hardware_call(
                "createI2C",
                &[pin_name(scl), pin_name(sda), config.frequency.into()],
            )?,
            BusPins::Spi { clock, mosi, miso } => self.hardware_call(
                "createSPI",
                &[
                    pin_name(clock),
                    mosi.as_ref().map(|pin| pin.name.as_str()).into(),
                    miso.as_ref().map(|pin| pin.name.as_str()).into(),
                ],
            )?,
        };
        let reference = self.expect(created, "object", ForeignValue::as_object)?;
        let token = BusToken(self.next_token);
        self.next_token += 1;
        self.buses.insert(token, reference);
        debug!(bus = %token, reference = reference.id(), "host bus opened");
        Ok(token)
    }

    fn bus_close(&mut self, bus: BusToken) -> Result<(), HalError> {
        let reference = self.buses.remove(&bus).ok_or(HalError::InvalidHandle(bus.0))?;
        let closed = self
            .bridge
            .call(reference, "deinit", &[])
            .map(|value| discard(&self.bridge, value));
        self.bridge.release(reference).map_err(backend)?;
        closed.map_err(backend)
    }

    fn i2c_write(&mut self, bus: BusToken, address: u8, data: &[u8]) -> Result<(), HalError> {
        let status = self.bus_call(bus, "writeto", &[address.into(), data.into()])?;
        match self.expect(status, "integer", ForeignValue::as_int)? {
            0 => Ok(()),
            _ => Err(HalError::NoDevice { address }),
        }
    }

    fn i2c_read(&mut self, bus: BusToken, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let value = self.bus_call(bus, "readfrom", &[address.into(), (buf.len() as i64).into()])?;
        self.read_buffer(value, address, buf)
    }

    fn i2c_write_read(
        &mut self,
        bus: BusToken,
        address: u8,
        write: &[u8],
        read: &mut [u8],
    ) -> Result<(), HalError> {
        let value = self.bus_call(
            bus,
            "writeto_then_readfrom",
            &[address.into(), write.into(), (read.len() as i64).into()],
        )?;
        self.read_buffer(value, address, read)
    }

    fn i2c_probe(&mut self, bus: BusToken, address: u8) -> Result<bool, HalError> {
        let value = self.bus_call(bus, "probe", &[address.into()])?;
        self.expect(value, "bool", ForeignValue::as_bool)
    }

    fn spi_configure(&mut self, bus: BusToken, config: &SpiConfig) -> Result<(), HalError> {
        let polarity = i64::from(config.polarity == Polarity::IdleHigh);
        let phase = i64::from(config.phase == Phase::CaptureOnSecondTransition);
        let value = self.bus_call(
            bus,
            "configure",
            &[
                config.baudrate.into(),
                polarity.into(),
                phase.into(),
                config.bits.into(),
            ],
        )?;
        discard(&self.bridge, value);
        Ok(())
    }

    fn spi_transfer(&mut self, bus: BusToken, write: &[u8], read: &mut [u8]) -> Result<(), HalError> {
        let value = self.bus_call(bus, "transfer", &[write.into()])?;
        let bytes = self.expect(value, "buffer", |value| value.as_bytes().map(<[u8]>::to_vec))?;
        if bytes.len() != read.len() {
            return Err(HalError::Backend(format!(
                "host returned {} bytes, expected {}",
                bytes.len(),
                read.len()
            )));
        }
        read.copy_from_slice(&bytes);
        Ok(())
    }
}

impl Drop for HostBridgedProvider {
    fn drop(&mut self) {
        let mut refs: Vec<ForeignRef> = self.buses.drain().map(|(_, reference)| reference).collect();
        refs.push(self.hardware);
        let released = self.bridge.try_with(|bridge| {
            for reference in refs {
                if let Err(err) = bridge.release(reference) {
                    warn!(reference = reference.id(), error = %err, "release on drop failed");
                }
            }
        });
        if released.is_none() {
            warn!("bridge busy; host hardware references leaked");
        }
    }
}
