//! # Runtime assembly
//!
//! Wires a simulated host, the marshalling bridge, a HAL context with the
//! configured provider, the scheduler and the supervisor together.
//!
//! The native model and the host's `hardware` object share one
//! [`VirtualPeripherals`], so tests can compare providers against the
//! same observable pins.

use crate::config::{ProviderChoice, RuntimeConfig};
use crate::error::SupervisorError;
use crate::supervisor::{RunSummary, Supervisor};
use coop_scheduler::Scheduler;
use hal::{
    BoardCatalog, Hal, HalContext, HalProvider, NativeProvider, NullProvider, PeripheralsHandle,
    VirtualPeripherals,
};
use host_bridge::{HostBridgedProvider, SharedBridge, SimController, SimHost};
use std::rc::Rc;
use tracing::info;

/// A fully assembled runtime over a simulated host
pub struct Runtime {
    supervisor: Supervisor,
    hal: HalContext,
    controller: SimController,
    peripherals: PeripheralsHandle,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, SupervisorError> {
        config.supervisor.validate()?;
        let board = BoardCatalog::builtin(&config.board)
            .ok_or_else(|| SupervisorError::Setup(format!("Unknown board: {}", config.board)))?;

        let peripherals = VirtualPeripherals::default().shared();
        let host = SimHost::with_hardware(board.clone(), Rc::clone(&peripherals));
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));

        let provider: Box<dyn HalProvider> = match config.provider {
            ProviderChoice::Native => {
                Box::new(NativeProvider::with_peripherals(Rc::clone(&peripherals)))
            }
            ProviderChoice::Host => Box::new(
                HostBridgedProvider::connect(bridge.clone())
                    .map_err(|err| SupervisorError::Setup(err.to_string()))?,
            ),
            ProviderChoice::Null => Box::new(NullProvider::new()),
        };
        let hal = Hal::new(board, provider).into_shared();
        info!(
            board = %config.board,
            provider = ?config.provider,
            "runtime assembled"
        );

        let scheduler = Scheduler::with_config(bridge, config.scheduler);
        let supervisor = Supervisor::with_scheduler(scheduler, config.supervisor).with_hal(hal.clone());
        Ok(Self {
            supervisor,
            hal,
            controller,
            peripherals,
        })
    }

    /// A runtime with default settings and the given provider
    pub fn with_provider(provider: ProviderChoice) -> Result<Self, SupervisorError> {
        Self::new(RuntimeConfig {
            provider,
            ..RuntimeConfig::default()
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut Supervisor {
        &mut self.supervisor
    }

    pub fn hal(&self) -> &HalContext {
        &self.hal
    }

    /// Controls the simulated host (clock, deferreds, failure injection)
    pub fn controller(&self) -> &SimController {
        &self.controller
    }

    /// The peripheral model behind both providers
    pub fn peripherals(&self) -> &PeripheralsHandle {
        &self.peripherals
    }

    /// Runs every task to completion
    pub fn run(&mut self) -> Result<RunSummary, SupervisorError> {
        self.supervisor.run_until_complete()
    }
}
