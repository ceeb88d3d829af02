//! Runtime configuration
//!
//! Every field has a default, so a JSON document only names what it
//! changes:
//!
//! ```json
//! {
//!   "provider": "host",
//!   "supervisor": { "max_steps_per_quantum": 16 },
//!   "scheduler": { "default_timeout": { "nanos": 500000000 } }
//! }
//! ```

use crate::error::SupervisorError;
use coop_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Task resumptions allowed per quantum
    pub max_steps_per_quantum: usize,
    /// Wall-clock budget per quantum (None = steps only)
    pub quantum_budget: Option<Duration>,
    /// Stop every task when one fails
    pub stop_on_task_failure: bool,
    /// Maximum quanta for `run_until_complete` (0 = unlimited)
    pub max_quanta: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_steps_per_quantum: 64,
            quantum_budget: None,
            stop_on_task_failure: false,
            max_quanta: 0,
        }
    }
}

impl SupervisorConfig {
    /// Loads a config from JSON; missing fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self, SupervisorError> {
        let config: SupervisorConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.max_steps_per_quantum == 0 {
            return Err(SupervisorError::Config(
                "max_steps_per_quantum must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which HAL provider backs the script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderChoice {
    /// In-process peripheral model
    #[default]
    Native,
    /// Forwarded through the host runtime's `hardware` object
    Host,
    /// No hardware at all
    Null,
}

impl ProviderChoice {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "native" => Some(ProviderChoice::Native),
            "host" => Some(ProviderChoice::Host),
            "null" => Some(ProviderChoice::Null),
            _ => None,
        }
    }
}

/// Everything needed to assemble a [`crate::Runtime`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub provider: ProviderChoice,
    /// Board catalog id
    pub board: String,
    pub supervisor: SupervisorConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: ProviderChoice::Native,
            board: "generic_metro".to_string(),
            supervisor: SupervisorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(text: &str) -> Result<Self, SupervisorError> {
        let config: RuntimeConfig = serde_json::from_str(text)?;
        config.supervisor.validate()?;
        Ok(config)
    }
}
