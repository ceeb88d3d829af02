//! Digital pin contract tests
//!
//! Claims, direction rules and observed writes must not depend on the
//! provider.

use crate::test_helpers::*;
use hal::{DigitalInOut, Direction, DriveMode, HalError, Pull};
use supervisor::Runtime;

/// Claims LED, toggles it three times, returns what the hardware saw
pub fn led_toggle_trace(runtime: &mut Runtime) -> Vec<bool> {
    let mut led = DigitalInOut::new(runtime.hal(), "LED").expect("LED claim failed");
    led.set_direction(Direction::Output).expect("direction failed");
    for value in [true, false, true] {
        led.set_value(value).expect("write failed");
    }
    let pin = board_pin(runtime, "LED");
    // the model borrow must end before `led` drops and releases the pin
    let history = runtime.peripherals().borrow().write_history(&pin);
    history
}

/// Exercises the direction rules; each entry is one observation
pub fn direction_rules_trace(runtime: &mut Runtime) -> Vec<Result<bool, HalError>> {
    let mut trace = Vec::new();
    let mut pin = DigitalInOut::new(runtime.hal(), "D5").expect("D5 claim failed");

    // input with pull-up and nothing driving it
    trace.push(pin.switch_to_input(Pull::Up).map(|()| true));
    trace.push(pin.value());
    trace.push(pin.set_value(true).map(|()| true));

    // external drive wins over the pull
    let physical = board_pin(runtime, "D5");
    runtime
        .peripherals()
        .borrow_mut()
        .drive_input(&physical, Some(false));
    trace.push(pin.value());

    // outputs read back their own level; pull is input-only
    trace.push(pin.switch_to_output(true, DriveMode::OpenDrain).map(|()| true));
    trace.push(pin.value());
    trace.push(pin.set_pull(Pull::Down).map(|()| true));
    trace.push(pin.drive_mode().map(|mode| mode == DriveMode::OpenDrain));

    trace.push(pin.deinit().map(|()| true));
    trace.push(pin.value());
    trace
}

/// Claim conflicts across aliases, and reclaim after release
pub fn claim_trace(runtime: &mut Runtime) -> Vec<Result<(), HalError>> {
    let hal = runtime.hal().clone();
    let mut trace = Vec::new();
    let mut first = DigitalInOut::new(&hal, "LED").expect("LED claim failed");
    trace.push(DigitalInOut::new(&hal, "LED").map(|_| ()));
    trace.push(DigitalInOut::new(&hal, "D13").map(|_| ()));
    trace.push(DigitalInOut::new(&hal, "D99").map(|_| ()));
    trace.push(first.deinit());
    // released pins are claimable again at once
    trace.push(DigitalInOut::new(&hal, "D13").map(|_| ()));
    trace
}

// ===== Contract Tests =====
