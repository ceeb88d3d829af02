//! Null provider: declares no capabilities, so every claim fails with
//! `CapabilityUnsupported`. Used when a board has no backend at all.

use crate::capability::CapabilitySet;
use crate::provider::{HalProvider, ProviderKind};

#[derive(Debug, Default)]
pub struct NullProvider;

impl NullProvider {
    pub fn new() -> Self {
        Self
    }
}

impl HalProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Null
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::error::HalError;
    use crate::pin::Pin;
    use crate::provider::PinMode;

    #[test]
    fn test_every_operation_unsupported() {
        let mut provider = NullProvider::new();
        let pin = Pin::new("D0", 0, "PA00", CapabilitySet::all());
        assert!(provider.capabilities().is_empty());
        assert_eq!(
            provider.pin_configure(&pin, PinMode::AnalogIn),
            Err(HalError::unsupported(Capability::AnalogIn, "null"))
        );
        assert_eq!(
            provider.digital_read(&pin),
            Err(HalError::unsupported(Capability::DigitalIo, "null"))
        );
    }
}
