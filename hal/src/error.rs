//! HAL error types

use crate::capability::Capability;
use thiserror::Error;

/// Errors raised by the hardware abstraction layer
///
/// The same variants are produced whichever provider is active, so script
/// code can handle failures without knowing where the hardware lives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HalError {
    /// No pin with this name on the board
    #[error("Unknown pin: {name}")]
    UnknownPin { name: String },

    /// The physical pin is already claimed
    #[error("Pin {pin} in use (claimed as {claimed_as})")]
    PinInUse { pin: String, claimed_as: String },

    /// The pin or the active provider cannot serve this capability
    #[error("{capability} not supported by {target}")]
    CapabilityUnsupported {
        capability: Capability,
        target: String,
    },

    /// The handle was never issued or has been released
    #[error("Invalid handle: {0}")]
    InvalidHandle(u32),

    /// Operation not valid in the pin's current mode
    #[error("Invalid mode: {0}")]
    InvalidMode(String),

    /// Bus operation attempted without holding the bus lock
    #[error("Bus not locked")]
    BusNotLocked,

    /// No device acknowledged the address
    #[error("No device at address {address:#04x}")]
    NoDevice { address: u8 },

    /// Bad argument to an operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Object used after deinit
    #[error("Object has been deinitialized")]
    Deinitialized,

    /// Provider replacement attempted while handles are live
    #[error("Provider busy: {live} live handle(s)")]
    ProviderBusy { live: usize },

    /// Failure reported by the provider's backend
    #[error("Backend error: {0}")]
    Backend(String),
}

impl HalError {
    /// Shorthand for a [`HalError::CapabilityUnsupported`]
    pub fn unsupported(capability: Capability, target: impl Into<String>) -> Self {
        Self::CapabilityUnsupported {
            capability,
            target: target.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = HalError::PinInUse {
            pin: "D13".to_string(),
            claimed_as: "LED".to_string(),
        };
        assert_eq!(err.to_string(), "Pin D13 in use (claimed as LED)");

        let err = HalError::unsupported(Capability::Spi, "null");
        assert_eq!(err.to_string(), "spi not supported by null");

        let err = HalError::NoDevice { address: 0x3c };
        assert_eq!(err.to_string(), "No device at address 0x3c");
    }
}
