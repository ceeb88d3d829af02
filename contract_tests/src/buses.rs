//! I2C and SPI contract tests
//!
//! Bus construction validates pin roles, operations require the bus lock,
//! and transfers return the same bytes whichever provider carries them.

use crate::test_helpers::*;
use hal::{HalError, I2c, Phase, Polarity, Spi, SpiConfig};
use supervisor::Runtime;

/// Address of the simulated temperature sensor
pub const SENSOR_ADDRESS: u8 = 0x48;

/// One observation from a bus scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Scan(Vec<u8>),
    Probe(u8, bool),
    Read(Vec<u8>),
    Failed(HalError),
}

fn record<T>(trace: &mut Vec<BusEvent>, result: Result<T, HalError>, ok: impl FnOnce(T) -> BusEvent) {
    trace.push(match result {
        Ok(value) => ok(value),
        Err(err) => BusEvent::Failed(err),
    });
}

/// Scans, probes and reads a sensor register over I2C
pub fn i2c_trace(runtime: &mut Runtime) -> Vec<BusEvent> {
    {
        let mut hw = runtime.peripherals().borrow_mut();
        hw.add_i2c_device(SENSOR_ADDRESS);
        hw.set_register(SENSOR_ADDRESS, 0x00, 0x19)
            .expect("register setup failed");
    }
    let mut trace = Vec::new();
    let mut i2c = I2c::new(runtime.hal(), "SCL", "SDA").expect("I2C open failed");

    record(&mut trace, i2c.scan(), BusEvent::Scan);
    i2c.try_lock().expect("lock failed");
    record(&mut trace, i2c.scan(), BusEvent::Scan);
    record(&mut trace, i2c.probe(SENSOR_ADDRESS), |found| {
        BusEvent::Probe(SENSOR_ADDRESS, found)
    });
    record(&mut trace, i2c.probe(0x49), |found| BusEvent::Probe(0x49, found));

    let mut buf = [0u8; 1];
    let read = i2c
        .writeto_then_readfrom(SENSOR_ADDRESS, &[0x00], &mut buf)
        .map(|()| buf.to_vec());
    record(&mut trace, read, BusEvent::Read);

    let mut buf = [0u8; 2];
    let missing = i2c.readfrom_into(0x20, &mut buf).map(|()| buf.to_vec());
    record(&mut trace, missing, BusEvent::Read);
    record(&mut trace, i2c.writeto(0x20, &[0x01]), |()| BusEvent::Read(Vec::new()));

    i2c.unlock().expect("unlock failed");
    i2c.deinit().expect("deinit failed");
    trace
}

/// Loopback transfers over SPI, with and without a MOSI line
pub fn spi_trace(runtime: &mut Runtime) -> Vec<BusEvent> {
    let mut trace = Vec::new();
    let mut spi = Spi::new(runtime.hal(), "SCK", Some("MOSI"), Some("MISO")).expect("SPI open failed");
    let config = SpiConfig {
        baudrate: 1_000_000,
        polarity: Polarity::IdleHigh,
        phase: Phase::CaptureOnSecondTransition,
        bits: 8,
    };

    record(&mut trace, spi.write(&[1]), |()| BusEvent::Read(Vec::new()));
    spi.try_lock().expect("lock failed");
    record(&mut trace, spi.configure(config), |()| BusEvent::Read(Vec::new()));

    let mut input = [0u8; 3];
    let echoed = spi
        .write_readinto(&[0xde, 0xad, 0xbe], &mut input)
        .map(|()| input.to_vec());
    record(&mut trace, echoed, BusEvent::Read);

    let mut input = [0u8; 2];
    let filled = spi.readinto(&mut input, 0x5a).map(|()| input.to_vec());
    record(&mut trace, filled, BusEvent::Read);
    spi.unlock().expect("unlock failed");
    spi.deinit().expect("deinit failed");

    let mut receive_only = Spi::new(runtime.hal(), "SCK", None, Some("MISO")).expect("SPI reopen failed");
    receive_only.try_lock().expect("lock failed");
    let mut input = [0xffu8; 2];
    let silent = receive_only.readinto(&mut input, 0x5a).map(|()| input.to_vec());
    record(&mut trace, silent, BusEvent::Read);
    trace
}

/// Bus construction on pins without the role, and pin conflicts
pub fn bus_pin_trace(runtime: &mut Runtime) -> Vec<Result<(), HalError>> {
    let hal = runtime.hal().clone();
    let held = I2c::new(&hal, "SCL", "SDA").expect("I2C open failed");
    let trace = vec![
        I2c::new(&hal, "D7", "D8").map(|_| ()),
        I2c::new(&hal, "A5", "A4").map(|_| ()),
        Spi::new(&hal, "D7", Some("MOSI"), None).map(|_| ()),
    ];
    drop(held);
    trace
}

// ===== Contract Tests =====
