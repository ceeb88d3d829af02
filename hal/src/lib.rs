//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the peripheral surface scripts program against and
//! the provider seam behind it.
//!
//! ## Philosophy
//!
//! **Where the hardware lives must not leak into script code.**
//!
//! A script opens a `DigitalInOut` on `LED` the same way whether the pin is
//! an in-process model, a device the host runtime reaches over USB, or
//! nothing at all.
//!
//! ## Design Principles
//!
//! 1. **Trait-based**: every hardware operation goes through [`HalProvider`]
//! 2. **One active provider** per [`Hal`] context, chosen at startup
//! 3. **Rules in the context**: claims, modes and scaling are enforced once,
//!    above the provider, so behavior is identical across backends
//! 4. **Explicit context**: proxies receive a [`HalContext`]; there is no
//!    global provider
//! 5. **Testable**: [`NativeProvider`] runs against an inspectable model

pub mod analogio;
pub mod board;
pub mod busio;
pub mod capability;
pub mod context;
pub mod digitalio;
pub mod error;
pub mod native;
pub mod null;
pub mod pin;
pub mod provider;

pub use analogio::{AnalogIn, AnalogOut};
pub use board::BoardCatalog;
pub use busio::{I2c, Spi};
pub use capability::{Capability, CapabilitySet};
pub use context::{BusHandle, Hal, HalContext, PeripheralHandle, PinState, PinValue};
pub use digitalio::DigitalInOut;
pub use error::HalError;
pub use native::{NativeProvider, PeripheralsHandle, VirtualPeripherals};
pub use null::NullProvider;
pub use pin::Pin;
pub use provider::{
    AnalogSample, BusPins, BusToken, Direction, DriveMode, HalProvider, I2cConfig, Phase, PinMode,
    Polarity, ProviderKind, Pull, SpiConfig,
};
