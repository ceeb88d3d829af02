//! Supervisor error types

use coop_scheduler::SchedulerError;
use thiserror::Error;

/// Supervisor error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    /// A fatal scheduler error ended the run loop
    #[error("Fatal scheduler error: {0}")]
    Fatal(SchedulerError),

    /// A previous quantum hit a fatal error
    #[error("Supervisor halted after a fatal error")]
    Halted,

    #[error("Configuration error: {0}")]
    Config(String),

    /// The configured quantum limit ran out before the tasks finished
    #[error("Quantum limit reached ({limit})")]
    QuantumLimit { limit: usize },

    /// The runtime could not be assembled
    #[error("Setup error: {0}")]
    Setup(String),
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Config(err.to_string())
    }
}
