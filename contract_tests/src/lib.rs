//! # Provider Contract Tests
//!
//! Golden tests for the script-facing surface: the same script must
//! observe the same behavior whichever provider backs it.
//!
//! ## Philosophy
//!
//! - **Behavior, not backend**: every scenario runs under the native and
//!   the host-bridged provider and the two traces must match
//! - **Golden values**: traces are also pinned to known outputs, so both
//!   backends cannot drift together unnoticed
//!
//! ## Structure
//!
//! One module per surface:
//! - Digital pins and claims
//! - Analog scaling
//! - I2C and SPI buses
//! - Scheduling through the supervisor

pub mod analog;
pub mod buses;
pub mod digital;
pub mod scheduling;

/// Common helpers for cross-provider scenarios
pub mod test_helpers {
    use hal::Pin;
    use std::fmt::Debug;
    use supervisor::{ProviderChoice, Runtime};

    /// Providers that must behave identically
    pub const EQUIVALENT_PROVIDERS: [ProviderChoice; 2] =
        [ProviderChoice::Native, ProviderChoice::Host];

    /// Creates a runtime with default settings
    pub fn runtime(provider: ProviderChoice) -> Runtime {
        Runtime::with_provider(provider).expect("Failed to assemble runtime")
    }

    /// Looks up a board pin by name
    pub fn board_pin(runtime: &Runtime, name: &str) -> Pin {
        runtime
            .hal()
            .with(|hal| hal.board().require(name).cloned())
            .expect("Pin missing from board")
    }

    /// Runs `scenario` under every equivalent provider and checks the
    /// traces agree; returns the common trace
    pub fn assert_same_behavior<T, F>(scenario: F) -> T
    where
        T: PartialEq + Debug,
        F: Fn(&mut Runtime) -> T,
    {
        let mut traces: Vec<T> = EQUIVALENT_PROVIDERS
            .iter()
            .map(|provider| scenario(&mut runtime(*provider)))
            .collect();
        let reference = traces.remove(0);
        for (provider, trace) in EQUIVALENT_PROVIDERS[1..].iter().zip(traces) {
            assert_eq!(
                trace, reference,
                "Provider {:?} diverged from {:?}",
                provider, EQUIVALENT_PROVIDERS[0]
            );
        }
        reference
    }
}
