//! Analog contract tests
//!
//! Readings are on the 16-bit scale under every provider, and outputs
//! reach the hardware unchanged.

use crate::test_helpers::*;
use hal::{AnalogIn, AnalogOut, HalError};
use supervisor::Runtime;

/// Raw converter values fed to the analog input
pub const RAW_STIMULUS: [u32; 5] = [0, 1, 1024, 2048, 4095];

/// Feeds each raw value to A1 and records the scaled reading
pub fn analog_in_trace(runtime: &mut Runtime) -> Vec<u16> {
    let sensor = AnalogIn::new(runtime.hal(), "A1").expect("A1 claim failed");
    let pin = board_pin(runtime, "A1");
    RAW_STIMULUS
        .iter()
        .map(|&raw| {
            runtime.peripherals().borrow_mut().set_analog_input(&pin, raw);
            sensor.value().expect("analog read failed")
        })
        .collect()
}

/// Writes levels to the A0 output and records what the hardware holds
pub fn analog_out_trace(runtime: &mut Runtime) -> Vec<Result<u16, HalError>> {
    let pin = board_pin(runtime, "A0");
    let mut dac = AnalogOut::new(runtime.hal(), "A0").expect("A0 claim failed");
    let mut trace = Vec::new();
    for level in [0u16, 1, 32768, u16::MAX] {
        trace.push(
            dac.set_value(level)
                .map(|()| runtime.peripherals().borrow().analog_output(&pin)),
        );
    }
    trace.push(dac.value());
    trace
}

/// Analog roles on pins that cannot serve them
pub fn analog_capability_trace(runtime: &mut Runtime) -> Vec<Result<(), HalError>> {
    vec![
        AnalogIn::new(runtime.hal(), "D7").map(|_| ()),
        AnalogOut::new(runtime.hal(), "D7").map(|_| ()),
    ]
}

// ===== Contract Tests =====
