//! Bus proxies
//!
//! Both buses follow the lock discipline scripts expect: take the lock
//! with `try_lock`, do the transfers, `unlock`. Transfers without the lock
//! fail with `BusNotLocked`.

use crate::context::{BusHandle, HalContext};
use crate::error::HalError;
use crate::provider::{I2cConfig, SpiConfig};
use tracing::warn;

fn close_on_drop(hal: &HalContext, bus: BusHandle) {
    match hal.try_with(|hal| hal.close_bus(&bus)) {
        Some(Ok(())) => {}
        Some(Err(err)) => warn!(bus = bus.id(), error = %err, "bus close on drop failed"),
        None => warn!(bus = bus.id(), "HAL busy, bus leaked on drop"),
    }
}

/// An I2C controller
pub struct I2c {
    hal: HalContext,
    bus: Option<BusHandle>,
    frequency: u32,
}

impl I2c {
    /// Opens the bus at the standard 100 kHz
    pub fn new(hal: &HalContext, scl: &str, sda: &str) -> Result<Self, HalError> {
        Self::with_config(hal, scl, sda, I2cConfig::default())
    }

    pub fn with_config(
        hal: &HalContext,
        scl: &str,
        sda: &str,
        config: I2cConfig,
    ) -> Result<Self, HalError> {
        let bus = hal.with(|hal| hal.open_i2c(scl, sda, config))?;
        Ok(Self {
            hal: hal.clone(),
            bus: Some(bus),
            frequency: config.frequency,
        })
    }

    fn bus(&self) -> Result<&BusHandle, HalError> {
        self.bus.as_ref().ok_or(HalError::Deinitialized)
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn try_lock(&mut self) -> Result<bool, HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.bus_try_lock(bus))
    }

    pub fn unlock(&mut self) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.bus_unlock(bus))
    }

    pub fn has_lock(&self) -> Result<bool, HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.bus_locked(bus))
    }

    /// Addresses that acknowledge, ascending
    pub fn scan(&mut self) -> Result<Vec<u8>, HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.i2c_scan(bus))
    }

    /// Checks one address without a transfer
    pub fn probe(&mut self, address: u8) -> Result<bool, HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.i2c_probe(bus, address))
    }

    pub fn writeto(&mut self, address: u8, data: &[u8]) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.i2c_write(bus, address, data))
    }

    pub fn readfrom_into(&mut self, address: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.i2c_read(bus, address, buf))
    }

    /// Write then read with a repeated start
    pub fn writeto_then_readfrom(
        &mut self,
        address: u8,
        out: &[u8],
        input: &mut [u8],
    ) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal
            .with(|hal| hal.i2c_write_read(bus, address, out, input))
    }

    pub fn deinit(&mut self) -> Result<(), HalError> {
        match self.bus.take() {
            Some(bus) => self.hal.with(|hal| hal.close_bus(&bus)),
            None => Ok(()),
        }
    }

    pub fn deinited(&self) -> bool {
        self.bus.is_none()
    }
}

impl Drop for I2c {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.take() {
            close_on_drop(&self.hal, bus);
        }
    }
}

/// An SPI controller
pub struct Spi {
    hal: HalContext,
    bus: Option<BusHandle>,
    config: SpiConfig,
}

impl Spi {
    /// Opens the bus; a missing data line makes that direction unavailable
    pub fn new(
        hal: &HalContext,
        clock: &str,
        mosi: Option<&str>,
        miso: Option<&str>,
    ) -> Result<Self, HalError> {
        let bus = hal.with(|hal| hal.open_spi(clock, mosi, miso))?;
        Ok(Self {
            hal: hal.clone(),
            bus: Some(bus),
            config: SpiConfig::default(),
        })
    }

    fn bus(&self) -> Result<&BusHandle, HalError> {
        self.bus.as_ref().ok_or(HalError::Deinitialized)
    }

    /// Frequency of the last successful `configure`
    pub fn frequency(&self) -> u32 {
        self.config.baudrate
    }

    pub fn try_lock(&mut self) -> Result<bool, HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.bus_try_lock(bus))
    }

    pub fn unlock(&mut self) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.bus_unlock(bus))
    }

    pub fn configure(&mut self, config: SpiConfig) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.spi_configure(bus, &config))?;
        self.config = config;
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal.with(|hal| hal.spi_write(bus, data))
    }

    pub fn readinto(&mut self, buf: &mut [u8], write_value: u8) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal
            .with(|hal| hal.spi_readinto(bus, buf, write_value))
    }

    pub fn write_readinto(&mut self, out: &[u8], input: &mut [u8]) -> Result<(), HalError> {
        let bus = self.bus()?;
        self.hal
            .with(|hal| hal.spi_write_readinto(bus, out, input))
    }

    pub fn deinit(&mut self) -> Result<(), HalError> {
        match self.bus.take() {
            Some(bus) => self.hal.with(|hal| hal.close_bus(&bus)),
            None => Ok(()),
        }
    }
}

impl Drop for Spi {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.take() {
            close_on_drop(&self.hal, bus);
        }
    }
}
