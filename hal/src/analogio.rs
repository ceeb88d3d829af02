//! Analog pin proxies
//!
//! Values are always on the full 16-bit scale. The context converts from
//! the provider's native converter resolution.

use crate::context::{HalContext, PeripheralHandle, PinValue};
use crate::error::HalError;
use crate::provider::PinMode;
use tracing::warn;

/// Reference voltage reported for analog inputs
pub const REFERENCE_VOLTAGE: f32 = 3.3;

fn release_on_drop(hal: &HalContext, handle: PeripheralHandle) {
    match hal.try_with(|hal| hal.release(&handle)) {
        Some(Ok(())) => {}
        Some(Err(err)) => warn!(pin = %handle.pin().name, error = %err, "release on drop failed"),
        None => warn!(pin = %handle.pin().name, "HAL busy, pin leaked on drop"),
    }
}

/// An analog input
pub struct AnalogIn {
    hal: HalContext,
    handle: Option<PeripheralHandle>,
}

impl AnalogIn {
    pub fn new(hal: &HalContext, pin: &str) -> Result<Self, HalError> {
        let handle = hal.with(|hal| hal.claim(pin, PinMode::AnalogIn))?;
        Ok(Self {
            hal: hal.clone(),
            handle: Some(handle),
        })
    }

    /// Current reading, 0..=65535
    pub fn value(&self) -> Result<u16, HalError> {
        let handle = self.handle.as_ref().ok_or(HalError::Deinitialized)?;
        match self.hal.with(|hal| hal.read(handle))? {
            PinValue::Analog(value) => Ok(value),
            other => Err(HalError::InvalidMode(format!(
                "unexpected {:?} from analog pin",
                other
            ))),
        }
    }

    pub fn reference_voltage(&self) -> f32 {
        REFERENCE_VOLTAGE
    }

    pub fn deinit(&mut self) -> Result<(), HalError> {
        match self.handle.take() {
            Some(handle) => self.hal.with(|hal| hal.release(&handle)),
            None => Ok(()),
        }
    }

    pub fn deinited(&self) -> bool {
        self.handle.is_none()
    }
}

impl Drop for AnalogIn {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            release_on_drop(&self.hal, handle);
        }
    }
}

/// An analog output
pub struct AnalogOut {
    hal: HalContext,
    handle: Option<PeripheralHandle>,
}

impl AnalogOut {
    pub fn new(hal: &HalContext, pin: &str) -> Result<Self, HalError> {
        let handle = hal.with(|hal| hal.claim(pin, PinMode::AnalogOut))?;
        Ok(Self {
            hal: hal.clone(),
            handle: Some(handle),
        })
    }

    /// Last value written
    pub fn value(&self) -> Result<u16, HalError> {
        let handle = self.handle.as_ref().ok_or(HalError::Deinitialized)?;
        match self.hal.with(|hal| hal.read(handle))? {
            PinValue::Analog(value) => Ok(value),
            other => Err(HalError::InvalidMode(format!(
                "unexpected {:?} from analog pin",
                other
            ))),
        }
    }

    pub fn set_value(&mut self, value: u16) -> Result<(), HalError> {
        let handle = self.handle.as_ref().ok_or(HalError::Deinitialized)?;
        self.hal
            .with(|hal| hal.write(handle, PinValue::Analog(value)))
    }

    pub fn deinit(&mut self) -> Result<(), HalError> {
        match self.handle.take() {
            Some(handle) => self.hal.with(|hal| hal.release(&handle)),
            None => Ok(()),
        }
    }
}

impl Drop for AnalogOut {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            release_on_drop(&self.hal, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardCatalog;
    use crate::capability::Capability;
    use crate::context::Hal;
    use crate::native::NativeProvider;

    fn setup() -> (HalContext, crate::native::PeripheralsHandle) {
        let provider = NativeProvider::new();
        let peripherals = provider.peripherals();
        let hal = Hal::new(BoardCatalog::generic_metro(), Box::new(provider)).into_shared();
        (hal, peripherals)
    }

    #[test]
    fn test_analog_in_scales_to_u16() {
        let (hal, peripherals) = setup();
        let pin = hal.with(|hal| hal.board().require("A2").cloned()).unwrap();
        let sensor = AnalogIn::new(&hal, "A2").unwrap();

        peripherals.borrow_mut().set_analog_input(&pin, 0);
        assert_eq!(sensor.value().unwrap(), 0);
        peripherals.borrow_mut().set_analog_input(&pin, 4095);
        assert_eq!(sensor.value().unwrap(), 65535);
        assert!((sensor.reference_voltage() - 3.3).abs() < f32::EPSILON);
    }

    #[test]
    fn test_analog_in_requires_capable_pin() {
        let (hal, _) = setup();
        assert!(matches!(
            AnalogIn::new(&hal, "D7"),
            Err(HalError::CapabilityUnsupported {
                capability: Capability::AnalogIn,
                ..
            })
        ));
    }

    #[test]
    fn test_analog_out_round_trip() {
        let (hal, peripherals) = setup();
        let mut dac = AnalogOut::new(&hal, "A0").unwrap();
        dac.set_value(40000).unwrap();
        assert_eq!(dac.value().unwrap(), 40000);

        let pin = hal.with(|hal| hal.board().require("A0").cloned()).unwrap();
        assert_eq!(peripherals.borrow().analog_output(&pin), 40000);

        dac.deinit().unwrap();
        assert_eq!(dac.set_value(1), Err(HalError::Deinitialized));
    }
}
