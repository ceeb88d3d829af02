//! # Marshalling bridge
//!
//! [`Bridge`] owns the reference table between embedded code and the host.
//!
//! ## Ownership rules
//!
//! - Every inbound host object arrives as a [`ForeignRef`] carrying one
//!   count owned by the receiver.
//! - [`Bridge::retain`] adds a count; [`Bridge::release`] drops one. The
//!   host object is disposed exactly once, when the count reaches zero.
//! - Releasing a disposed reference is a [`ForeignCallError::DoubleRelease`].
//! - The same host object always maps to the same `ForeignRef` while it is
//!   live.
//!
//! Embedded functions the host may call are registered as callables and
//! dispatched by [`SharedBridge::pump`], outside any borrow of the bridge,
//! so a callable is free to use the bridge itself.

use crate::error::ForeignCallError;
use crate::host::HostRuntime;
use crate::value::{CallbackId, ForeignRef, ForeignValue, HostHandle, HostValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// An embedded function callable from the host
pub type Callable = Rc<dyn Fn(&[ForeignValue]) -> Result<ForeignValue, ForeignCallError>>;

struct RefEntry {
    handle: HostHandle,
    count: u32,
    kind: ValueKind,
}

#[derive(Debug, Default)]
struct Counters {
    created: u64,
    disposed: u64,
    double_releases: u64,
    calls: u64,
    host_errors: u64,
    callbacks_dispatched: u64,
    stale_callbacks: u64,
}

/// Reference and call counters, for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// References currently in the table
    pub live_references: usize,
    /// Sum of the counts of live references
    pub outstanding_counts: u64,
    pub references_created: u64,
    pub references_disposed: u64,
    pub double_releases: u64,
    pub registered_callables: usize,
    pub calls: u64,
    pub host_errors: u64,
    pub callbacks_dispatched: u64,
    /// Callbacks that fired after their callable was unregistered
    pub stale_callbacks: u64,
    /// Fired host callbacks not yet pumped
    pub pending_host_callbacks: usize,
}

impl BridgeStats {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome of one [`SharedBridge::pump`]
#[derive(Debug, Default)]
pub struct PumpReport {
    pub dispatched: usize,
    pub stale: usize,
    /// Failures raised by callables, in dispatch order
    pub errors: Vec<ForeignCallError>,
}

/// Reference table plus the host it talks to
pub struct Bridge {
    host: Box<dyn HostRuntime>,
    refs: BTreeMap<ForeignRef, RefEntry>,
    by_handle: HashMap<HostHandle, ForeignRef>,
    next_ref: u32,
    callables: HashMap<CallbackId, Callable>,
    next_callback: u32,
    global: Option<ForeignRef>,
    counters: Counters,
}

impl Bridge {
    pub fn new(host: Box<dyn HostRuntime>) -> Self {
        Self {
            host,
            refs: BTreeMap::new(),
            by_handle: HashMap::new(),
            next_ref: 1,
            callables: HashMap::new(),
            next_callback: 1,
            global: None,
            counters: Counters::default(),
        }
    }

    /// Wraps the bridge for sharing
    pub fn into_shared(self) -> SharedBridge {
        SharedBridge {
            inner: Rc::new(RefCell::new(self)),
        }
    }

    /// Reference to the host's global object
    ///
    /// The bridge owns this reference; callers must not release it.
    pub fn global(&mut self) -> ForeignRef {
        match self.global {
            Some(reference) => reference,
            None => {
                let handle = self.host.global();
                let reference = self.wrap_handle(handle, ValueKind::Object);
                self.global = Some(reference);
                reference
            }
        }
    }

    /// Marshals an embedded value into a host object reference
    ///
    /// An `Object` is already host-side: it gains a count instead.
    pub fn to_host(&mut self, value: &ForeignValue) -> Result<ForeignRef, ForeignCallError> {
        if let ForeignValue::Object(reference) = value {
            self.retain(*reference)?;
            return Ok(*reference);
        }
        let outbound = self.outbound(value)?;
        let handle = self
            .host
            .adopt(outbound)
            .map_err(|err| self.host_failure("adopt", err.message))?;
        Ok(self.wrap_handle(handle, value.kind()))
    }

    /// Unmarshals a reference into an embedded value
    ///
    /// Boxed primitives come back by value. A non-primitive object comes
    /// back as `Object` of the same reference, with one more count.
    pub fn from_host(&mut self, reference: ForeignRef) -> Result<ForeignValue, ForeignCallError> {
        let handle = self.entry(reference)?.handle;
        let value = self
            .host
            .read(handle)
            .map_err(|err| self.host_failure("read", err.message))?;
        self.inbound(value)
    }

    /// Calls a method on a host object
    ///
    /// A host exception becomes [`ForeignCallError::Host`] with the host's
    /// message intact.
    pub fn call(
        &mut self,
        target: ForeignRef,
        method: &str,
        args: &[ForeignValue],
    ) -> Result<ForeignValue, ForeignCallError> {
        let handle = self.entry(target)?.handle;
        let args = args
            .iter()
            .map(|arg| self.outbound(arg))
            .collect::<Result<Vec<_>, _>>()?;
        self.counters.calls += 1;
        trace!(reference = target.id(), method, "host call");
        match self.host.invoke(handle, method, args) {
            Ok(value) => self.inbound(value),
            Err(err) => Err(self.host_failure(method, err.message)),
        }
    }

    /// Adds a count to a reference
    pub fn retain(&mut self, reference: ForeignRef) -> Result<u32, ForeignCallError> {
        let entry = self.entry_mut(reference)?;
        entry.count += 1;
        Ok(entry.count)
    }

    /// Drops a count; disposes the host object at zero
    ///
    /// Returns the remaining count.
    pub fn release(&mut self, reference: ForeignRef) -> Result<u32, ForeignCallError> {
        let remaining = match self.refs.get_mut(&reference) {
            Some(entry) => {
                entry.count -= 1;
                entry.count
            }
            None => return Err(self.dead_reference(reference)),
        };
        if remaining == 0 {
            if let Some(entry) = self.refs.remove(&reference) {
                self.by_handle.remove(&entry.handle);
                self.host.dispose(entry.handle);
                self.counters.disposed += 1;
                if self.global == Some(reference) {
                    self.global = None;
                }
                debug!(reference = reference.id(), kind = %entry.kind, "reference disposed");
            }
        }
        Ok(remaining)
    }

    /// Current count, or `None` once disposed
    pub fn ref_count(&self, reference: ForeignRef) -> Option<u32> {
        self.refs.get(&reference).map(|entry| entry.count)
    }

    /// Kind tag of a live reference
    pub fn kind_of(&self, reference: ForeignRef) -> Option<ValueKind> {
        self.refs.get(&reference).map(|entry| entry.kind)
    }

    /// Registers an embedded function the host may call
    pub fn register_callable<F>(&mut self, callable: F) -> CallbackId
    where
        F: Fn(&[ForeignValue]) -> Result<ForeignValue, ForeignCallError> + 'static,
    {
        let id = CallbackId(self.next_callback);
        self.next_callback += 1;
        self.callables.insert(id, Rc::new(callable));
        id
    }

    /// Removes a callable; later host calls to it are dropped as stale
    pub fn unregister_callable(&mut self, id: CallbackId) -> Result<(), ForeignCallError> {
        self.callables
            .remove(&id)
            .map(|_| ())
            .ok_or(ForeignCallError::UnknownCallback(id))
    }

    pub fn is_registered(&self, id: CallbackId) -> bool {
        self.callables.contains_key(&id)
    }

    /// Lets the host event loop make progress
    pub fn run_pending(&mut self) -> bool {
        self.host.run_pending()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            live_references: self.refs.len(),
            outstanding_counts: self.refs.values().map(|entry| u64::from(entry.count)).sum(),
            references_created: self.counters.created,
            references_disposed: self.counters.disposed,
            double_releases: self.counters.double_releases,
            registered_callables: self.callables.len(),
            calls: self.counters.calls,
            host_errors: self.counters.host_errors,
            callbacks_dispatched: self.counters.callbacks_dispatched,
            stale_callbacks: self.counters.stale_callbacks,
            pending_host_callbacks: self.host.pending_callbacks(),
        }
    }

    fn entry(&self, reference: ForeignRef) -> Result<&RefEntry, ForeignCallError> {
        self.refs
            .get(&reference)
            .ok_or(ForeignCallError::UnknownReference(reference))
    }

    fn entry_mut(&mut self, reference: ForeignRef) -> Result<&mut RefEntry, ForeignCallError> {
        self.refs
            .get_mut(&reference)
            .ok_or(ForeignCallError::UnknownReference(reference))
    }

    fn dead_reference(&mut self, reference: ForeignRef) -> ForeignCallError {
        if reference.0 != 0 && reference.0 < self.next_ref {
            self.counters.double_releases += 1;
            warn!(reference = reference.id(), "release of disposed reference");
            ForeignCallError::DoubleRelease(reference)
        } else {
            ForeignCallError::UnknownReference(reference)
        }
    }

    fn host_failure(&mut self, method: &str, message: String) -> ForeignCallError {
        self.counters.host_errors += 1;
        warn!(method, error = %message, "host call failed");
        ForeignCallError::Host {
            method: method.to_string(),
            message,
        }
    }

    fn wrap_handle(&mut self, handle: HostHandle, kind: ValueKind) -> ForeignRef {
        if let Some(&reference) = self.by_handle.get(&handle) {
            if let Some(entry) = self.refs.get_mut(&reference) {
                entry.count += 1;
                return reference;
            }
        }
        let reference = ForeignRef(self.next_ref);
        self.next_ref += 1;
        self.refs.insert(
            reference,
            RefEntry {
                handle,
                count: 1,
                kind,
            },
        );
        self.by_handle.insert(handle, reference);
        self.counters.created += 1;
        reference
    }

    fn outbound(&self, value: &ForeignValue) -> Result<HostValue, ForeignCallError> {
        Ok(match value {
            ForeignValue::None => HostValue::Undefined,
            ForeignValue::Bool(v) => HostValue::Bool(*v),
            ForeignValue::Int(v) => HostValue::Int(*v),
            ForeignValue::Float(v) => HostValue::Float(*v),
            ForeignValue::Str(v) => HostValue::Str(v.clone()),
            ForeignValue::Bytes(v) => HostValue::Bytes(v.clone()),
            ForeignValue::Callable(id) => {
                if !self.callables.contains_key(id) {
                    return Err(ForeignCallError::UnknownCallback(*id));
                }
                HostValue::Callback(*id)
            }
            ForeignValue::Object(reference) => HostValue::Handle(self.entry(*reference)?.handle),
        })
    }

    /// Converts callback arguments; on failure nothing stays wrapped
    fn inbound_all(&mut self, args: Vec<HostValue>) -> Result<Vec<ForeignValue>, ForeignCallError> {
        let mut converted = Vec::with_capacity(args.len());
        for arg in args {
            match self.inbound(arg) {
                Ok(value) => converted.push(value),
                Err(err) => {
                    for value in converted {
                        if let ForeignValue::Object(reference) = value {
                            let _ = self.release(reference);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(converted)
    }

    fn inbound(&mut self, value: HostValue) -> Result<ForeignValue, ForeignCallError> {
        Ok(match value {
            HostValue::Undefined | HostValue::Null => ForeignValue::None,
            HostValue::Bool(v) => ForeignValue::Bool(v),
            HostValue::Int(v) => ForeignValue::Int(v),
            HostValue::Float(v) => ForeignValue::Float(v),
            HostValue::Str(v) => ForeignValue::Str(v),
            HostValue::Bytes(v) => ForeignValue::Bytes(v),
            HostValue::Callback(id) => {
                if !self.callables.contains_key(&id) {
                    return Err(ForeignCallError::UnknownCallback(id));
                }
                ForeignValue::Callable(id)
            }
            HostValue::Handle(handle) => {
                ForeignValue::Object(self.wrap_handle(handle, ValueKind::Object))
            }
        })
    }
}

/// Shared, single-threaded handle to a [`Bridge`]
#[derive(Clone)]
pub struct SharedBridge {
    inner: Rc<RefCell<Bridge>>,
}

impl SharedBridge {
    pub fn new(host: Box<dyn HostRuntime>) -> Self {
        Bridge::new(host).into_shared()
    }

    /// Runs `f` with exclusive access to the bridge
    pub fn with<R>(&self, f: impl FnOnce(&mut Bridge) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    /// Like [`SharedBridge::with`], but `None` if the bridge is borrowed
    pub fn try_with<R>(&self, f: impl FnOnce(&mut Bridge) -> R) -> Option<R> {
        self.inner.try_borrow_mut().ok().map(|mut bridge| f(&mut bridge))
    }

    pub fn global(&self) -> ForeignRef {
        self.with(Bridge::global)
    }

    pub fn to_host(&self, value: &ForeignValue) -> Result<ForeignRef, ForeignCallError> {
        self.with(|bridge| bridge.to_host(value))
    }

    pub fn from_host(&self, reference: ForeignRef) -> Result<ForeignValue, ForeignCallError> {
        self.with(|bridge| bridge.from_host(reference))
    }

    pub fn call(
        &self,
        target: ForeignRef,
        method: &str,
        args: &[ForeignValue],
    ) -> Result<ForeignValue, ForeignCallError> {
        self.with(|bridge| bridge.call(target, method, args))
    }

    pub fn retain(&self, reference: ForeignRef) -> Result<u32, ForeignCallError> {
        self.with(|bridge| bridge.retain(reference))
    }

    pub fn release(&self, reference: ForeignRef) -> Result<u32, ForeignCallError> {
        self.with(|bridge| bridge.release(reference))
    }

    pub fn ref_count(&self, reference: ForeignRef) -> Option<u32> {
        self.inner.borrow().ref_count(reference)
    }

    pub fn register_callable<F>(&self, callable: F) -> CallbackId
    where
        F: Fn(&[ForeignValue]) -> Result<ForeignValue, ForeignCallError> + 'static,
    {
        self.with(|bridge| bridge.register_callable(callable))
    }

    pub fn unregister_callable(&self, id: CallbackId) -> Result<(), ForeignCallError> {
        self.with(|bridge| bridge.unregister_callable(id))
    }

    pub fn run_pending(&self) -> bool {
        self.with(Bridge::run_pending)
    }

    pub fn stats(&self) -> BridgeStats {
        self.inner.borrow().stats()
    }

    /// Dispatches every host callback that fired since the last pump
    ///
    /// Callables run in the order the host fired them. A failing callable
    /// is recorded in the report and does not stop the others.
    pub fn pump(&self) -> PumpReport {
        let batch: Vec<_> = self.with(|bridge| {
            let fired = bridge.host.poll_callbacks();
            fired
                .into_iter()
                .map(|fired| {
                    let callable = bridge.callables.get(&fired.callback).cloned();
                    let args = match callable {
                        Some(_) => bridge.inbound_all(fired.args),
                        None => Ok(Vec::new()),
                    };
                    (fired.callback, callable, args)
                })
                .collect()
        });

        let mut report = PumpReport::default();
        for (id, callable, args) in batch {
            let Some(callable) = callable else {
                debug!(callback = id.0, "stale host callback dropped");
                report.stale += 1;
                continue;
            };
            let outcome = args.and_then(|args| callable(&args));
            match outcome {
                Ok(_) => report.dispatched += 1,
                Err(err) => {
                    warn!(callback = id.0, error = %err, "host callback failed");
                    report.errors.push(ForeignCallError::Callback {
                        callback: id,
                        message: err.to_string(),
                    });
                }
            }
        }

        self.with(|bridge| {
            bridge.counters.callbacks_dispatched += report.dispatched as u64;
            bridge.counters.stale_callbacks += report.stale as u64;
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_host::SimHost;
    use hal::BoardCatalog;
    use std::cell::Cell;

    fn bridge() -> SharedBridge {
        SharedBridge::new(Box::new(SimHost::new(BoardCatalog::generic_metro())))
    }

    #[test]
    fn test_primitive_round_trip() {
        let bridge = bridge();
        for value in [
            ForeignValue::Int(42),
            ForeignValue::Bool(true),
            ForeignValue::Float(1.5),
            ForeignValue::from("hello"),
            ForeignValue::from(vec![1u8, 2, 3]),
        ] {
            let reference = bridge.to_host(&value).unwrap();
            assert_eq!(bridge.from_host(reference).unwrap(), value);
            assert_eq!(bridge.release(reference).unwrap(), 0);
        }
        assert_eq!(bridge.stats().live_references, 0);
    }

    #[test]
    fn test_retain_release_disposes_once() {
        let bridge = bridge();
        let reference = bridge.to_host(&ForeignValue::Int(1)).unwrap();
        bridge.retain(reference).unwrap();
        bridge.retain(reference).unwrap();

        assert_eq!(bridge.release(reference).unwrap(), 2);
        assert_eq!(bridge.release(reference).unwrap(), 1);
        assert_eq!(bridge.release(reference).unwrap(), 0);
        assert_eq!(bridge.ref_count(reference), None);
        assert_eq!(
            bridge.release(reference),
            Err(ForeignCallError::DoubleRelease(reference))
        );

        let stats = bridge.stats();
        assert_eq!(stats.references_disposed, 1);
        assert_eq!(stats.double_releases, 1);
    }

    #[test]
    fn test_unknown_reference() {
        let bridge = bridge();
        let bogus = ForeignRef(999);
        assert_eq!(
            bridge.release(bogus),
            Err(ForeignCallError::UnknownReference(bogus))
        );
    }

    #[test]
    fn test_object_identity_is_stable() {
        let bridge = bridge();
        let global = bridge.global();
        let first = bridge.call(global, "hardware", &[]).unwrap();
        let second = bridge.call(global, "hardware", &[]).unwrap();
        let reference = first.as_object().unwrap();
        assert_eq!(second.as_object(), Some(reference));
        assert_eq!(bridge.ref_count(reference), Some(2));

        // an object passed back out gains a count instead of a new box
        let again = bridge.to_host(&first).unwrap();
        assert_eq!(again, reference);
        assert_eq!(bridge.ref_count(reference), Some(3));
    }

    #[test]
    fn test_host_error_preserved() {
        let bridge = bridge();
        let global = bridge.global();
        let err = bridge.call(global, "noSuchMethod", &[]).unwrap_err();
        match err {
            ForeignCallError::Host { method, message } => {
                assert_eq!(method, "noSuchMethod");
                assert!(message.contains("noSuchMethod"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(bridge.stats().host_errors, 1);
    }

    #[test]
    fn test_unregistered_callable_rejected_outbound() {
        let bridge = bridge();
        let global = bridge.global();
        let err = bridge
            .call(
                global,
                "setTimeout",
                &[ForeignValue::Callable(CallbackId(77)), ForeignValue::Int(5)],
            )
            .unwrap_err();
        assert_eq!(err, ForeignCallError::UnknownCallback(CallbackId(77)));
    }

    #[test]
    fn test_pump_dispatches_and_drops_stale() {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));
        let global = bridge.global();

        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let live = bridge.register_callable(move |_| {
            counter.set(counter.get() + 1);
            Ok(ForeignValue::None)
        });
        let gone = bridge.register_callable(|_| Ok(ForeignValue::None));

        for id in [live, gone] {
            let timer = bridge
                .call(global, "setTimeout", &[ForeignValue::Callable(id), ForeignValue::Int(10)])
                .unwrap();
            bridge.release(timer.as_object().unwrap()).unwrap();
        }
        bridge.unregister_callable(gone).unwrap();

        controller.advance(core_types::Duration::from_millis(10));
        let report = bridge.pump();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.stale, 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(bridge.stats().stale_callbacks, 1);
    }

    #[test]
    fn test_callable_may_reenter_bridge() {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));
        let global = bridge.global();

        let inner = bridge.clone();
        let id = bridge.register_callable(move |_| {
            let now = inner.call(inner.global(), "now", &[])?;
            assert_eq!(now.as_float(), Some(5.0));
            Ok(ForeignValue::None)
        });
        let timer = bridge
            .call(global, "setTimeout", &[ForeignValue::Callable(id), ForeignValue::Int(5)])
            .unwrap();
        bridge.release(timer.as_object().unwrap()).unwrap();

        controller.advance(core_types::Duration::from_millis(5));
        let report = bridge.pump();
        assert_eq!(report.dispatched, 1);
        assert!(report.errors.is_empty());
    }

    /// Appends a callback nobody registered to every fired callback
    struct ExtraArgHost(SimHost);

    impl HostRuntime for ExtraArgHost {
        fn global(&self) -> HostHandle {
            self.0.global()
        }
        fn adopt(&mut self, value: HostValue) -> Result<HostHandle, crate::error::HostError> {
            self.0.adopt(value)
        }
        fn read(&self, handle: HostHandle) -> Result<HostValue, crate::error::HostError> {
            self.0.read(handle)
        }
        fn invoke(
            &mut self,
            target: HostHandle,
            method: &str,
            args: Vec<HostValue>,
        ) -> Result<HostValue, crate::error::HostError> {
            self.0.invoke(target, method, args)
        }
        fn dispose(&mut self, handle: HostHandle) {
            self.0.dispose(handle)
        }
        fn poll_callbacks(&mut self) -> Vec<crate::host::HostCallback> {
            self.0
                .poll_callbacks()
                .into_iter()
                .map(|mut fired| {
                    fired.args.push(HostValue::Callback(CallbackId(404)));
                    fired
                })
                .collect()
        }
        fn pending_callbacks(&self) -> usize {
            self.0.pending_callbacks()
        }
        fn run_pending(&mut self) -> bool {
            self.0.run_pending()
        }
    }

    #[test]
    fn test_pump_unwraps_arguments_when_conversion_fails() {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(ExtraArgHost(host)));
        let global = bridge.global();

        let hits = Rc::new(Cell::new(0));
        let counter = Rc::clone(&hits);
        let id = bridge.register_callable(move |_| {
            counter.set(counter.get() + 1);
            Ok(ForeignValue::None)
        });
        let deferred = bridge.call(global, "createDeferred", &[]).unwrap();
        let reference = deferred.as_object().unwrap();
        bridge
            .call(reference, "then", &[ForeignValue::Callable(id)])
            .unwrap();
        let handle = controller.pending_deferreds()[0];
        let live = bridge.stats().live_references;

        // settles with itself, so the first argument wraps a known object
        assert!(controller.resolve(handle, HostValue::Handle(handle)));
        let report = bridge.pump();

        assert_eq!(hits.get(), 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(bridge.ref_count(reference), Some(1));
        assert_eq!(bridge.stats().live_references, live);
        bridge.release(reference).unwrap();
    }

    #[test]
    fn test_stats_json() {
        let bridge = bridge();
        let reference = bridge.to_host(&ForeignValue::Int(1)).unwrap();
        let json = bridge.stats().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["live_references"], 1);
        assert_eq!(value["outstanding_counts"], 1);
        bridge.release(reference).unwrap();
    }
}
