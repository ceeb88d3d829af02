//! # Supervisor
//!
//! Runs embedded-style scripts inside a host event loop.
//!
//! ## Philosophy
//!
//! - **The host loop is never blocked**: work runs in bounded quanta
//! - **Failures are reported, not swallowed**: a failing task is captured
//!   in the quantum report; only fatal scheduler errors end the run
//! - **Deterministic mode is first-class**: the simulated host's virtual
//!   clock drives every timing test
//!
//! ## Responsibilities
//!
//! - Assembles host, bridge, HAL and scheduler ([`Runtime`])
//! - Executes quanta and the run-until-complete entry point ([`Supervisor`])
//! - Loads configuration from JSON ([`RuntimeConfig`])

pub mod config;
pub mod error;
pub mod runtime;
pub mod scripts;
pub mod supervisor;

pub use config::{ProviderChoice, RuntimeConfig, SupervisorConfig};
pub use error::SupervisorError;
pub use runtime::Runtime;
pub use scripts::{Blink, SharedTally, Tally};
pub use supervisor::{QuantumOutcome, QuantumReport, RunSummary, Supervisor, TaskFailure};
