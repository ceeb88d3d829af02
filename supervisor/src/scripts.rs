//! Built-in scripts
//!
//! Small tasks used by the `supervisor` binary and the contract tests.
//! They only touch hardware through the proxies, so they behave the same
//! under every provider.

use coop_scheduler::{Resume, Step, Task, TaskContext, TaskError, WaitOn};
use core_types::Duration;
use hal::{AnalogIn, DigitalInOut, DriveMode, HalContext};
use std::cell::RefCell;
use std::rc::Rc;

/// Writes a pattern to a digital output, sleeping between writes
///
/// The pin is claimed on the first resumption and released when the
/// pattern is done.
pub struct Blink {
    hal: HalContext,
    pin: String,
    pattern: Vec<bool>,
    period: Duration,
    led: Option<DigitalInOut>,
    next: usize,
}

impl Blink {
    pub fn new(hal: &HalContext, pin: &str, pattern: Vec<bool>, period: Duration) -> Self {
        Self {
            hal: hal.clone(),
            pin: pin.to_string(),
            pattern,
            period,
            led: None,
            next: 0,
        }
    }

    /// `count` writes alternating high and low, starting high
    pub fn toggles(hal: &HalContext, pin: &str, count: usize, period: Duration) -> Self {
        let pattern = (0..count).map(|i| i % 2 == 0).collect();
        Self::new(hal, pin, pattern, period)
    }
}

impl Task for Blink {
    fn resume(&mut self, _cx: &mut TaskContext<'_>, resume: Resume) -> Result<Step, TaskError> {
        resume.check()?;
        if self.led.is_none() {
            let mut led = DigitalInOut::new(&self.hal, &self.pin).map_err(TaskError::failed)?;
            led.switch_to_output(false, DriveMode::PushPull)
                .map_err(TaskError::failed)?;
            self.led = Some(led);
        }
        let Some(led) = self.led.as_mut() else {
            return Err(TaskError::failed("pin closed"));
        };
        let Some(&value) = self.pattern.get(self.next) else {
            led.deinit().map_err(TaskError::failed)?;
            return Ok(Step::Done);
        };
        led.set_value(value).map_err(TaskError::failed)?;
        self.next += 1;
        if self.next < self.pattern.len() {
            Ok(Step::Wait(WaitOn::Sleep(self.period)))
        } else {
            led.deinit().map_err(TaskError::failed)?;
            Ok(Step::Done)
        }
    }
}

/// Shared result of the counting scripts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Tally {
    pub count: u32,
    /// Labels in increment order
    pub order: Vec<String>,
}

pub type SharedTally = Rc<RefCell<Tally>>;

/// Sleeps once, then increments the tally
pub fn sleep_then_count(
    label: &str,
    delay: Duration,
    tally: SharedTally,
) -> impl FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> {
    let label = label.to_string();
    move |_cx, resume| match resume.check()? {
        Resume::Start => Ok(Step::Wait(WaitOn::Sleep(delay))),
        _ => {
            let mut tally = tally.borrow_mut();
            tally.count += 1;
            tally.order.push(label.clone());
            Ok(Step::Done)
        }
    }
}

/// Samples an analog input `samples` times, `period` apart
pub fn sample_analog(
    hal: &HalContext,
    pin: &str,
    samples: usize,
    period: Duration,
    readings: Rc<RefCell<Vec<u16>>>,
) -> impl FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> {
    let hal = hal.clone();
    let pin = pin.to_string();
    let mut input: Option<AnalogIn> = None;
    move |_cx, resume| {
        resume.check()?;
        if input.is_none() {
            input = Some(AnalogIn::new(&hal, &pin).map_err(TaskError::failed)?);
        }
        let Some(adc) = input.as_ref() else {
            return Err(TaskError::failed("pin closed"));
        };
        let value = adc.value().map_err(TaskError::failed)?;
        let taken = {
            let mut readings = readings.borrow_mut();
            readings.push(value);
            readings.len()
        };
        if taken < samples {
            Ok(Step::Wait(WaitOn::Sleep(period)))
        } else {
            input = None;
            Ok(Step::Done)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_pattern() {
        let hal = hal::Hal::new(
            hal::BoardCatalog::generic_metro(),
            Box::new(hal::NativeProvider::new()),
        )
        .into_shared();
        let blink = Blink::toggles(&hal, "LED", 4, Duration::from_millis(1));
        assert_eq!(blink.pattern, vec![true, false, true, false]);
    }
}
