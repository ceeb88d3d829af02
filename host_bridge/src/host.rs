//! The host runtime seam
//!
//! [`HostRuntime`] is everything the bridge needs from the surrounding
//! runtime: call a method on one of its objects, box and unbox values,
//! drop objects, and hand over callbacks that fired. The host never calls
//! embedded code synchronously; it queues [`HostCallback`]s and the bridge
//! dispatches them when pumped.

use crate::error::HostError;
use crate::value::{CallbackId, HostHandle, HostValue};

/// A callback the host wants to run
#[derive(Debug, Clone, PartialEq)]
pub struct HostCallback {
    pub callback: CallbackId,
    pub args: Vec<HostValue>,
}

/// The surrounding (host) runtime
pub trait HostRuntime {
    /// Handle of the host's global object
    fn global(&self) -> HostHandle;

    /// Boxes an embedded value as a host object
    fn adopt(&mut self, value: HostValue) -> Result<HostHandle, HostError>;

    /// Unboxes a host object
    ///
    /// Boxed primitives come back as themselves; anything else comes back
    /// as `HostValue::Handle` of the same object.
    fn read(&self, handle: HostHandle) -> Result<HostValue, HostError>;

    /// Calls `method` on the object
    fn invoke(
        &mut self,
        target: HostHandle,
        method: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue, HostError>;

    /// The embedded side no longer references the object
    fn dispose(&mut self, handle: HostHandle);

    /// Drains the callbacks that fired since the last poll
    fn poll_callbacks(&mut self) -> Vec<HostCallback>;

    /// Number of fired callbacks waiting to be polled
    fn pending_callbacks(&self) -> usize;

    /// Lets the host's own event loop make progress
    ///
    /// Returns false if the host has nothing left that could ever fire.
    fn run_pending(&mut self) -> bool;
}
