//! # Host bridge
//!
//! Foreign-call marshalling between embedded script code and the host
//! runtime it runs inside.
//!
//! ## Philosophy
//!
//! **The host owns its objects; the bridge owns the bookkeeping.**
//!
//! Embedded code never holds a raw host handle. It holds counted
//! [`ForeignRef`]s, and the bridge disposes each host object exactly once.
//!
//! ## Pieces
//!
//! - [`HostRuntime`]: the seam to the surrounding runtime
//! - [`Bridge`] / [`SharedBridge`]: reference table, calls, callback pump
//! - [`SimHost`]: deterministic host with a virtual clock and hardware
//! - [`HostBridgedProvider`]: a HAL provider that forwards to the host

pub mod bridge;
pub mod error;
pub mod host;
pub mod provider;
pub mod sim_host;
pub mod value;

pub use bridge::{Bridge, BridgeStats, Callable, PumpReport, SharedBridge};
pub use error::{ForeignCallError, HostError};
pub use host::{HostCallback, HostRuntime};
pub use provider::HostBridgedProvider;
pub use sim_host::{SimController, SimHost};
pub use value::{CallbackId, ForeignRef, ForeignValue, HostHandle, HostValue, ValueKind};
