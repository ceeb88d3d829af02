//! Digital pin proxy

use crate::context::{HalContext, PeripheralHandle, PinValue};
use crate::error::HalError;
use crate::provider::{Direction, DriveMode, PinMode, Pull};
use tracing::warn;

/// A digital input/output pin
///
/// Starts as an input with no pull. Reading an output returns the last
/// value written. The claim is released on [`DigitalInOut::deinit`] or drop.
pub struct DigitalInOut {
    hal: HalContext,
    handle: Option<PeripheralHandle>,
}

impl DigitalInOut {
    /// Claims `pin` for digital I/O
    pub fn new(hal: &HalContext, pin: &str) -> Result<Self, HalError> {
        let handle = hal.with(|hal| hal.claim(pin, PinMode::Digital))?;
        Ok(Self {
            hal: hal.clone(),
            handle: Some(handle),
        })
    }

    fn handle(&self) -> Result<&PeripheralHandle, HalError> {
        self.handle.as_ref().ok_or(HalError::Deinitialized)
    }

    /// Name of the claimed pin
    pub fn pin_name(&self) -> Option<&str> {
        self.handle.as_ref().map(|h| h.pin().name.as_str())
    }

    pub fn direction(&self) -> Result<Direction, HalError> {
        let handle = self.handle()?;
        Ok(self.hal.with(|hal| hal.state(handle))?.direction)
    }

    /// Switches direction with default settings: outputs start low
    /// (push-pull), inputs have no pull
    pub fn set_direction(&mut self, direction: Direction) -> Result<(), HalError> {
        match direction {
            Direction::Output => self.switch_to_output(false, DriveMode::PushPull),
            Direction::Input => self.switch_to_input(Pull::None),
        }
    }

    pub fn switch_to_output(&mut self, value: bool, drive: DriveMode) -> Result<(), HalError> {
        let handle = self.handle()?;
        self.hal
            .with(|hal| hal.switch_to_output(handle, value, drive))
    }

    pub fn switch_to_input(&mut self, pull: Pull) -> Result<(), HalError> {
        let handle = self.handle()?;
        self.hal.with(|hal| hal.switch_to_input(handle, pull))
    }

    pub fn value(&self) -> Result<bool, HalError> {
        let handle = self.handle()?;
        match self.hal.with(|hal| hal.read(handle))? {
            PinValue::Digital(level) => Ok(level),
            other => Err(HalError::InvalidMode(format!(
                "unexpected {:?} from digital pin",
                other
            ))),
        }
    }

    /// Fails with `InvalidMode` on an input
    pub fn set_value(&mut self, value: bool) -> Result<(), HalError> {
        let handle = self.handle()?;
        self.hal
            .with(|hal| hal.write(handle, PinValue::Digital(value)))
    }

    pub fn pull(&self) -> Result<Pull, HalError> {
        let handle = self.handle()?;
        Ok(self.hal.with(|hal| hal.state(handle))?.pull)
    }

    /// Fails with `InvalidMode` on an output
    pub fn set_pull(&mut self, pull: Pull) -> Result<(), HalError> {
        let handle = self.handle()?;
        self.hal.with(|hal| hal.set_pull(handle, pull))
    }

    pub fn drive_mode(&self) -> Result<DriveMode, HalError> {
        let handle = self.handle()?;
        Ok(self.hal.with(|hal| hal.state(handle))?.drive)
    }

    /// Fails with `InvalidMode` on an input
    pub fn set_drive_mode(&mut self, drive: DriveMode) -> Result<(), HalError> {
        let handle = self.handle()?;
        self.hal.with(|hal| hal.set_drive_mode(handle, drive))
    }

    /// Releases the pin; further use fails with `Deinitialized`
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

impl Drop for DigitalInOut {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            match self.hal.try_with(|hal| hal.release(&handle)) {
                Some(Ok(())) => {}
                Some(Err(err)) => warn!(pin = %handle.pin().name, error = %err, "release on drop failed"),
                None => warn!(pin = %handle.pin().name, "HAL busy, pin leaked on drop"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardCatalog;
    use crate::context::Hal;
    use crate::native::NativeProvider;

    fn setup() -> (HalContext, crate::native::PeripheralsHandle) {
        let provider = NativeProvider::new();
        let peripherals = provider.peripherals();
        let hal = Hal::new(BoardCatalog::generic_metro(), Box::new(provider)).into_shared();
        (hal, peripherals)
    }

    #[test]
    fn test_defaults_to_input() {
        let (hal, _) = setup();
        let pin = DigitalInOut::new(&hal, "D2").unwrap();
        assert_eq!(pin.direction().unwrap(), Direction::Input);
        assert_eq!(pin.pull().unwrap(), Pull::None);
        assert!(!pin.value().unwrap());
    }

    #[test]
    fn test_led_toggle_observed_by_provider() {
        let (hal, peripherals) = setup();
        let mut led = DigitalInOut::new(&hal, "LED").unwrap();
        led.set_direction(Direction::Output).unwrap();
        for _ in 0..3 {
            let current = led.value().unwrap();
            led.set_value(!current).unwrap();
        }

        let pin = hal.with(|hal| hal.board().require("LED").cloned()).unwrap();
        assert_eq!(
            peripherals.borrow().write_history(&pin),
            vec![true, false, true]
        );
    }

    #[test]
    fn test_input_reads_external_level() {
        let (hal, peripherals) = setup();
        let mut button = DigitalInOut::new(&hal, "BUTTON").unwrap();
        button.set_pull(Pull::Up).unwrap();
        assert!(button.value().unwrap());

        let pin = hal.with(|hal| hal.board().require("BUTTON").cloned()).unwrap();
        peripherals.borrow_mut().drive_input(&pin, Some(false));
        assert!(!button.value().unwrap());
    }

    #[test]
    fn test_mode_errors() {
        let (hal, _) = setup();
        let mut pin = DigitalInOut::new(&hal, "D3").unwrap();
        assert!(matches!(pin.set_value(true), Err(HalError::InvalidMode(_))));
        pin.switch_to_output(true, DriveMode::OpenDrain).unwrap();
        assert_eq!(pin.drive_mode().unwrap(), DriveMode::OpenDrain);
        assert!(pin.value().unwrap());
        assert!(matches!(pin.set_pull(Pull::Down), Err(HalError::InvalidMode(_))));
    }

    #[test]
    fn test_deinit_and_drop_release_claim() {
        let (hal, _) = setup();
        let mut pin = DigitalInOut::new(&hal, "D8").unwrap();
        pin.deinit().unwrap();
        assert!(pin.deinited());
        assert_eq!(pin.value(), Err(HalError::Deinitialized));
        assert!(pin.deinit().is_ok());

        {
            let _held = DigitalInOut::new(&hal, "D8").unwrap();
            assert!(matches!(
                DigitalInOut::new(&hal, "D8"),
                Err(HalError::PinInUse { .. })
            ));
        }
        assert!(!hal.is_claimed("D8"));
        assert!(DigitalInOut::new(&hal, "D8").is_ok());
    }
}
