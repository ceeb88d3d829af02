//! # Simulated host runtime
//!
//! A deterministic stand-in for the surrounding runtime, used by tests and
//! by embedders that have no real host.
//!
//! - **Clock**: virtual; only moves when [`SimController::advance`] or
//!   [`HostRuntime::run_pending`] moves it.
//! - **Timers**: `setTimeout`/`clearTimeout` on the global object. Timers
//!   with the same deadline fire in registration order.
//! - **Deferreds**: promise-like objects from `createDeferred`; `then`
//!   subscribes a callback, `resolve` settles.
//! - **Hardware**: the `hardware` object drives a [`VirtualPeripherals`]
//!   model, so a host-bridged provider sees the same board a native one
//!   does.
//!
//! Callbacks are never run synchronously. They queue up and the bridge
//! collects them with [`HostRuntime::poll_callbacks`].

use crate::error::HostError;
use crate::host::{HostCallback, HostRuntime};
use crate::value::{CallbackId, HostHandle, HostValue};
use core_types::{Duration, Instant};
use hal::{
    BoardCatalog, BusPins, BusToken, CapabilitySet, DriveMode, HalError, I2cConfig, NativeProvider,
    PeripheralsHandle, Phase, Pin, PinMode, Polarity, Pull, SpiConfig, VirtualPeripherals,
};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use tracing::trace;

const GLOBAL: HostHandle = HostHandle(1);
const HARDWARE: HostHandle = HostHandle(2);

/// I2C status code for an address nobody acknowledged
const I2C_NACK: i64 = 2;

type TimerKey = (Instant, u64);

enum SimObject {
    Global,
    Hardware,
    Boxed(HostValue),
    Timer(TimerKey),
    Deferred(DeferredState),
    I2cBus(BusToken),
    SpiBus(BusToken),
}

enum DeferredState {
    Pending(Vec<CallbackId>),
    Settled(HostValue),
}

#[derive(Clone, Copy)]
enum Target {
    Global,
    Hardware,
    Boxed,
    Timer,
    Deferred,
    I2c(BusToken),
    Spi(BusToken),
}

impl Target {
    fn name(self) -> &'static str {
        match self {
            Target::Global => "global",
            Target::Hardware => "hardware",
            Target::Boxed => "boxed",
            Target::Timer => "timer",
            Target::Deferred => "deferred",
            Target::I2c(_) => "i2c",
            Target::Spi(_) => "spi",
        }
    }
}

struct SimState {
    now: Instant,
    objects: HashMap<HostHandle, SimObject>,
    next_handle: u64,
    board: BoardCatalog,
    hardware: PeripheralsHandle,
    capabilities: CapabilitySet,
    timers: BTreeMap<TimerKey, CallbackId>,
    next_timer_seq: u64,
    fired: VecDeque<HostCallback>,
    call_log: Vec<String>,
    failing: HashSet<String>,
}

fn not_a_function(target: Target, method: &str) -> HostError {
    HostError::new(format!("{}.{} is not a function", target.name(), method))
}

fn arg<'a>(args: &'a [HostValue], index: usize, method: &str) -> Result<&'a HostValue, HostError> {
    args.get(index)
        .ok_or_else(|| HostError::new(format!("{method}: missing argument {index}")))
}

fn bad_arg(method: &str, index: usize, expected: &str) -> HostError {
    HostError::new(format!("{method}: argument {index} must be {expected}"))
}

fn arg_str<'a>(args: &'a [HostValue], index: usize, method: &str) -> Result<&'a str, HostError> {
    match arg(args, index, method)? {
        HostValue::Str(value) => Ok(value),
        _ => Err(bad_arg(method, index, "a string")),
    }
}

fn arg_opt_str<'a>(
    args: &'a [HostValue],
    index: usize,
    method: &str,
) -> Result<Option<&'a str>, HostError> {
    match args.get(index) {
        None | Some(HostValue::Undefined) | Some(HostValue::Null) => Ok(None),
        Some(HostValue::Str(value)) => Ok(Some(value)),
        Some(_) => Err(bad_arg(method, index, "a string or undefined")),
    }
}

fn arg_bool(args: &[HostValue], index: usize, method: &str) -> Result<bool, HostError> {
    match arg(args, index, method)? {
        HostValue::Bool(value) => Ok(*value),
        _ => Err(bad_arg(method, index, "a boolean")),
    }
}

fn arg_number(args: &[HostValue], index: usize, method: &str) -> Result<f64, HostError> {
    match arg(args, index, method)? {
        HostValue::Int(value) => Ok(*value as f64),
        HostValue::Float(value) => Ok(*value),
        _ => Err(bad_arg(method, index, "a number")),
    }
}

fn arg_int(args: &[HostValue], index: usize, method: &str) -> Result<i64, HostError> {
    match arg(args, index, method)? {
        HostValue::Int(value) => Ok(*value),
        HostValue::Float(value) if value.fract() == 0.0 => Ok(*value as i64),
        _ => Err(bad_arg(method, index, "an integer")),
    }
}

fn arg_u8(args: &[HostValue], index: usize, method: &str) -> Result<u8, HostError> {
    u8::try_from(arg_int(args, index, method)?).map_err(|_| bad_arg(method, index, "a byte"))
}

fn arg_len(args: &[HostValue], index: usize, method: &str) -> Result<usize, HostError> {
    usize::try_from(arg_int(args, index, method)?)
        .map_err(|_| bad_arg(method, index, "a non-negative length"))
}

fn arg_bytes<'a>(args: &'a [HostValue], index: usize, method: &str) -> Result<&'a [u8], HostError> {
    match arg(args, index, method)? {
        HostValue::Bytes(value) => Ok(value),
        _ => Err(bad_arg(method, index, "a buffer")),
    }
}

fn arg_callback(args: &[HostValue], index: usize, method: &str) -> Result<CallbackId, HostError> {
    match arg(args, index, method)? {
        HostValue::Callback(id) => Ok(*id),
        _ => Err(bad_arg(method, index, "a function")),
    }
}

fn hal_failure(err: HalError) -> HostError {
    HostError::new(err.to_string())
}

impl SimState {
    fn alloc(&mut self, object: SimObject) -> HostHandle {
        let handle = HostHandle(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    fn target(&self, handle: HostHandle) -> Result<Target, HostError> {
        let object = self
            .objects
            .get(&handle)
            .ok_or_else(|| HostError::new(format!("object {} has been disposed", handle.0)))?;
        Ok(match object {
            SimObject::Global => Target::Global,
            SimObject::Hardware => Target::Hardware,
            SimObject::Boxed(_) => Target::Boxed,
            SimObject::Timer(_) => Target::Timer,
            SimObject::Deferred(_) => Target::Deferred,
            SimObject::I2cBus(token) => Target::I2c(*token),
            SimObject::SpiBus(token) => Target::Spi(*token),
        })
    }

    fn pin(&self, args: &[HostValue], index: usize, method: &str) -> Result<Pin, HostError> {
        let name = arg_str(args, index, method)?;
        self.board
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::new(format!("pin {name} not found")))
    }

    fn opt_pin(&self, args: &[HostValue], index: usize, method: &str) -> Result<Option<Pin>, HostError> {
        match arg_opt_str(args, index, method)? {
            Some(_) => self.pin(args, index, method).map(Some),
            None => Ok(None),
        }
    }

    fn invoke(
        &mut self,
        handle: HostHandle,
        method: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue, HostError> {
        let target = self.target(handle)?;
        self.call_log.push(format!("{}.{}", target.name(), method));
        trace!(target_kind = target.name(), method, "sim host call");
        if self.failing.contains(method) {
            return Err(HostError::new(format!("{method}: injected failure")));
        }
        match target {
            Target::Global => self.invoke_global(method, &args),
            Target::Hardware => self.invoke_hardware(method, &args),
            Target::Deferred => self.invoke_deferred(handle, method, &args),
            Target::I2c(token) => self.invoke_i2c(token, method, &args),
            Target::Spi(token) => self.invoke_spi(token, method, &args),
            Target::Boxed => match (method, self.objects.get(&handle)) {
                ("valueOf", Some(SimObject::Boxed(value))) => Ok(value.clone()),
                _ => Err(not_a_function(target, method)),
            },
            Target::Timer => Err(not_a_function(target, method)),
        }
    }

    fn invoke_global(&mut self, method: &str, args: &[HostValue]) -> Result<HostValue, HostError> {
        match method {
            "now" => Ok(HostValue::Float(self.now.as_nanos() as f64 / 1_000_000.0)),
            "setTimeout" => {
                let callback = arg_callback(args, 0, method)?;
                let millis = arg_number(args, 1, method)?.max(0.0);
                let deadline = self.now + Duration::from_nanos((millis * 1_000_000.0) as u64);
                let key = (deadline, self.next_timer_seq);
                self.next_timer_seq += 1;
                self.timers.insert(key, callback);
                Ok(HostValue::Handle(self.alloc(SimObject::Timer(key))))
            }
            "clearTimeout" => {
                if let Some(HostValue::Handle(handle)) = args.first() {
                    if let Some(SimObject::Timer(key)) = self.objects.get(handle) {
                        let key = *key;
                        self.timers.remove(&key);
                    }
                }
                Ok(HostValue::Undefined)
            }
            "createDeferred" => Ok(HostValue::Handle(
                self.alloc(SimObject::Deferred(DeferredState::Pending(Vec::new()))),
            )),
            "hardware" => Ok(HostValue::Handle(HARDWARE)),
            _ => Err(not_a_function(Target::Global, method)),
        }
    }

    fn invoke_deferred(
        &mut self,
        handle: HostHandle,
        method: &str,
        args: &[HostValue],
    ) -> Result<HostValue, HostError> {
        match method {
            "then" => {
                let callback = arg_callback(args, 0, method)?;
                if let Some(SimObject::Deferred(state)) = self.objects.get_mut(&handle) {
                    match state {
                        DeferredState::Pending(waiters) => waiters.push(callback),
                        DeferredState::Settled(value) => self.fired.push_back(HostCallback {
                            callback,
                            args: vec![value.clone()],
                        }),
                    }
                }
                Ok(HostValue::Undefined)
            }
            "resolve" => {
                let value = args.first().cloned().unwrap_or(HostValue::Undefined);
                self.settle(handle, value);
                Ok(HostValue::Undefined)
            }
            _ => Err(not_a_function(Target::Deferred, method)),
        }
    }

    /// Settles a pending deferred; returns false if it was not pending
    fn settle(&mut self, handle: HostHandle, value: HostValue) -> bool {
        let Some(SimObject::Deferred(state)) = self.objects.get_mut(&handle) else {
            return false;
        };
        let waiters = match state {
            DeferredState::Pending(waiters) => std::mem::take(waiters),
            DeferredState::Settled(_) => return false,
        };
        *state = DeferredState::Settled(value.clone());
        for callback in waiters {
            self.fired.push_back(HostCallback {
                callback,
                args: vec![value.clone()],
            });
        }
        true
    }

    fn invoke_hardware(&mut self, method: &str, args: &[HostValue]) -> Result<HostValue, HostError> {
        let hardware = Rc::clone(&self.hardware);
        let mut hw = hardware.borrow_mut();
        match method {
            "capabilities" => Ok(HostValue::Int(i64::from(self.capabilities.bits()))),
            "analogResolution" => Ok(HostValue::Int(i64::from(hw.adc_bits()))),
            "configurePin" => {
                let pin = self.pin(args, 0, method)?;
                let mode_name = arg_str(args, 1, method)?;
                let mode = PinMode::from_name(mode_name)
                    .ok_or_else(|| HostError::new(format!("unknown pin mode {mode_name}")))?;
                hw.configure(&pin, mode);
                Ok(HostValue::Undefined)
            }
            "releasePin" => {
                hw.deinit(&self.pin(args, 0, method)?);
                Ok(HostValue::Undefined)
            }
            "switchToOutput" => {
                let pin = self.pin(args, 0, method)?;
                let initial = arg_bool(args, 1, method)?;
                let drive = if arg_bool(args, 2, method)? {
                    DriveMode::OpenDrain
                } else {
                    DriveMode::PushPull
                };
                hw.switch_to_output(&pin, initial, drive);
                Ok(HostValue::Undefined)
            }
            "switchToInput" | "setPull" => {
                let pin = self.pin(args, 0, method)?;
                let pull_name = arg_str(args, 1, method)?;
                let pull = Pull::from_name(pull_name)
                    .ok_or_else(|| HostError::new(format!("unknown pull {pull_name}")))?;
                if method == "switchToInput" {
                    hw.switch_to_input(&pin, pull);
                } else {
                    hw.set_pull(&pin, pull);
                }
                Ok(HostValue::Undefined)
            }
            "digitalWrite" => {
                let pin = self.pin(args, 0, method)?;
                hw.write(&pin, arg_bool(args, 1, method)?);
                Ok(HostValue::Undefined)
            }
            "digitalRead" => Ok(HostValue::Bool(hw.read(&self.pin(args, 0, method)?))),
            "analogRead" => {
                let sample = hw.analog_read(&self.pin(args, 0, method)?);
                Ok(HostValue::Int(i64::from(sample.raw)))
            }
            "analogWrite" => {
                let pin = self.pin(args, 0, method)?;
                let value = u16::try_from(arg_int(args, 1, method)?)
                    .map_err(|_| bad_arg(method, 1, "in 0..=65535"))?;
                hw.analog_write(&pin, value);
                Ok(HostValue::Undefined)
            }
            "createI2C" => {
                let pins = BusPins::I2c {
                    scl: self.pin(args, 0, method)?,
                    sda: self.pin(args, 1, method)?,
                    config: I2cConfig {
                        frequency: u32::try_from(arg_int(args, 2, method)?)
                            .map_err(|_| bad_arg(method, 2, "a frequency"))?,
                    },
                };
                let token = hw.bus_open(&pins);
                drop(hw);
                Ok(HostValue::Handle(self.alloc(SimObject::I2cBus(token))))
            }
            "createSPI" => {
                let pins = BusPins::Spi {
                    clock: self.pin(args, 0, method)?,
                    mosi: self.opt_pin(args, 1, method)?,
                    miso: self.opt_pin(args, 2, method)?,
                };
                let token = hw.bus_open(&pins);
                drop(hw);
                Ok(HostValue::Handle(self.alloc(SimObject::SpiBus(token))))
            }
            _ => Err(not_a_function(Target::Hardware, method)),
        }
    }

    fn invoke_i2c(
        &mut self,
        token: BusToken,
        method: &str,
        args: &[HostValue],
    ) -> Result<HostValue, HostError> {
        let mut hw = self.hardware.borrow_mut();
        match method {
            "writeto" => {
                let address = arg_u8(args, 0, method)?;
                match hw.i2c_write(token, address, arg_bytes(args, 1, method)?) {
                    Ok(()) => Ok(HostValue::Int(0)),
                    Err(HalError::NoDevice { .. }) => Ok(HostValue::Int(I2C_NACK)),
                    Err(err) => Err(hal_failure(err)),
                }
            }
            "readfrom" => {
                let address = arg_u8(args, 0, method)?;
                let mut buf = vec![0u8; arg_len(args, 1, method)?];
                match hw.i2c_read(token, address, &mut buf) {
                    Ok(()) => Ok(HostValue::Bytes(buf)),
                    Err(HalError::NoDevice { .. }) => Ok(HostValue::Null),
                    Err(err) => Err(hal_failure(err)),
                }
            }
            "writeto_then_readfrom" => {
                let address = arg_u8(args, 0, method)?;
                let out = arg_bytes(args, 1, method)?;
                let mut buf = vec![0u8; arg_len(args, 2, method)?];
                let result = hw
                    .i2c_write(token, address, out)
                    .and_then(|()| hw.i2c_read(token, address, &mut buf));
                match result {
                    Ok(()) => Ok(HostValue::Bytes(buf)),
                    Err(HalError::NoDevice { .. }) => Ok(HostValue::Null),
                    Err(err) => Err(hal_failure(err)),
                }
            }
            "probe" => {
                let address = arg_u8(args, 0, method)?;
                hw.i2c_probe(token, address)
                    .map(HostValue::Bool)
                    .map_err(hal_failure)
            }
            "deinit" => hw
                .bus_close(token)
                .map(|()| HostValue::Undefined)
                .map_err(hal_failure),
            _ => Err(not_a_function(Target::I2c(token), method)),
        }
    }

    fn invoke_spi(
        &mut self,
        token: BusToken,
        method: &str,
        args: &[HostValue],
    ) -> Result<HostValue, HostError> {
        let mut hw = self.hardware.borrow_mut();
        match method {
            "configure" => {
                let config = SpiConfig {
                    baudrate: u32::try_from(arg_int(args, 0, method)?)
                        .map_err(|_| bad_arg(method, 0, "a baudrate"))?,
                    polarity: if arg_int(args, 1, method)? == 0 {
                        Polarity::IdleLow
                    } else {
                        Polarity::IdleHigh
                    },
                    phase: if arg_int(args, 2, method)? == 0 {
                        Phase::CaptureOnFirstTransition
                    } else {
                        Phase::CaptureOnSecondTransition
                    },
                    bits: arg_u8(args, 3, method)?,
                };
                hw.spi_configure(token, &config)
                    .map(|()| HostValue::Undefined)
                    .map_err(hal_failure)
            }
            "transfer" => {
                let out = arg_bytes(args, 0, method)?;
                let mut read = vec![0u8; out.len()];
                hw.spi_transfer(token, out, &mut read)
                    .map(|()| HostValue::Bytes(read))
                    .map_err(hal_failure)
            }
            "deinit" => hw
                .bus_close(token)
                .map(|()| HostValue::Undefined)
                .map_err(hal_failure),
            _ => Err(not_a_function(Target::Spi(token), method)),
        }
    }

    fn fire_due(&mut self) {
        while let Some((&key, &callback)) = self.timers.first_key_value() {
            if key.0 > self.now {
                break;
            }
            self.timers.remove(&key);
            self.fired.push_back(HostCallback {
                callback,
                args: Vec::new(),
            });
        }
    }

    fn advance_to(&mut self, instant: Instant) {
        if instant > self.now {
            self.now = instant;
        }
        self.fire_due();
    }
}

/// The simulated host runtime
pub struct SimHost {
    state: Rc<RefCell<SimState>>,
}

impl SimHost {
    /// A host over `board` with a fresh peripheral model
    pub fn new(board: BoardCatalog) -> Self {
        Self::with_hardware(board, VirtualPeripherals::default().shared())
    }

    /// A host over an existing peripheral model
    pub fn with_hardware(board: BoardCatalog, hardware: PeripheralsHandle) -> Self {
        let mut objects = HashMap::new();
        objects.insert(GLOBAL, SimObject::Global);
        objects.insert(HARDWARE, SimObject::Hardware);
        Self {
            state: Rc::new(RefCell::new(SimState {
                now: Instant::ZERO,
                objects,
                next_handle: 3,
                board,
                hardware,
                capabilities: NativeProvider::CAPABILITIES,
                timers: BTreeMap::new(),
                next_timer_seq: 0,
                fired: VecDeque::new(),
                call_log: Vec::new(),
                failing: HashSet::new(),
            })),
        }
    }

    /// Handle for driving the host from outside
    pub fn controller(&self) -> SimController {
        SimController {
            state: Rc::clone(&self.state),
        }
    }
}

impl HostRuntime for SimHost {
    fn global(&self) -> HostHandle {
        GLOBAL
    }

    fn adopt(&mut self, value: HostValue) -> Result<HostHandle, HostError> {
        match value {
            HostValue::Handle(handle) => Ok(handle),
            other => Ok(self.state.borrow_mut().alloc(SimObject::Boxed(other))),
        }
    }

    fn read(&self, handle: HostHandle) -> Result<HostValue, HostError> {
        match self.state.borrow().objects.get(&handle) {
            Some(SimObject::Boxed(value)) => Ok(value.clone()),
            Some(_) => Ok(HostValue::Handle(handle)),
            None => Err(HostError::new(format!(
                "object {} has been disposed",
                handle.0
            ))),
        }
    }

    fn invoke(
        &mut self,
        target: HostHandle,
        method: &str,
        args: Vec<HostValue>,
    ) -> Result<HostValue, HostError> {
        self.state.borrow_mut().invoke(target, method, args)
    }

    fn dispose(&mut self, handle: HostHandle) {
        if handle != GLOBAL && handle != HARDWARE {
            self.state.borrow_mut().objects.remove(&handle);
        }
    }

    fn poll_callbacks(&mut self) -> Vec<HostCallback> {
        self.state.borrow_mut().fired.drain(..).collect()
    }

    fn pending_callbacks(&self) -> usize {
        self.state.borrow().fired.len()
    }

    fn run_pending(&mut self) -> bool {
        let mut state = self.state.borrow_mut();
        if !state.fired.is_empty() {
            return true;
        }
        match state.timers.first_key_value().map(|(key, _)| key.0) {
            Some(deadline) => {
                state.advance_to(deadline);
                true
            }
            None => false,
        }
    }
}

/// Drives and inspects a [`SimHost`] from outside
#[derive(Clone)]
pub struct SimController {
    state: Rc<RefCell<SimState>>,
}

impl SimController {
    pub fn now(&self) -> Instant {
        self.state.borrow().now
    }

    /// Moves the clock forward, firing every timer that comes due
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.borrow_mut();
        let target = state.now + by;
        state.advance_to(target);
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.state
            .borrow()
            .timers
            .first_key_value()
            .map(|(key, _)| key.0)
    }

    pub fn active_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }

    /// Deferreds that have not settled, oldest first
    pub fn pending_deferreds(&self) -> Vec<HostHandle> {
        let state = self.state.borrow();
        let mut pending: Vec<HostHandle> = state
            .objects
            .iter()
            .filter(|(_, object)| {
                matches!(object, SimObject::Deferred(DeferredState::Pending(_)))
            })
            .map(|(handle, _)| *handle)
            .collect();
        pending.sort();
        pending
    }

    /// Settles a deferred from the host side
    pub fn resolve(&self, deferred: HostHandle, value: HostValue) -> bool {
        self.state.borrow_mut().settle(deferred, value)
    }

    /// Queues a callback with arguments of the caller's choosing
    pub fn fire_callback(&self, callback: CallbackId, args: Vec<HostValue>) {
        self.state
            .borrow_mut()
            .fired
            .push_back(HostCallback { callback, args });
    }

    /// The peripheral model behind the `hardware` object
    pub fn hardware(&self) -> PeripheralsHandle {
        Rc::clone(&self.state.borrow().hardware)
    }

    pub fn board(&self) -> BoardCatalog {
        self.state.borrow().board.clone()
    }

    /// Changes the capabilities the `hardware` object reports
    pub fn set_capabilities(&self, capabilities: CapabilitySet) {
        self.state.borrow_mut().capabilities = capabilities;
    }

    /// Makes every call to `method` raise
    pub fn fail_method(&self, method: &str) {
        self.state.borrow_mut().failing.insert(method.to_string());
    }

    pub fn heal_method(&self, method: &str) {
        self.state.borrow_mut().failing.remove(method);
    }

    /// Calls made so far, as `target.method`
    pub fn call_log(&self) -> Vec<String> {
        self.state.borrow().call_log.clone()
    }

    pub fn clear_call_log(&self) {
        self.state.borrow_mut().call_log.clear();
    }

    /// Objects alive besides the global and hardware objects
    pub fn live_objects(&self) -> usize {
        self.state.borrow().objects.len().saturating_sub(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> (SimHost, SimController) {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        (host, controller)
    }

    fn timer(host: &mut SimHost, id: u32, millis: i64) -> HostHandle {
        match host
            .invoke(
                GLOBAL,
                "setTimeout",
                vec![HostValue::Callback(CallbackId(id)), HostValue::Int(millis)],
            )
            .unwrap()
        {
            HostValue::Handle(handle) => handle,
            other => panic!("expected handle, got {other:?}"),
        }
    }

    #[test]
    fn test_timers_fire_in_deadline_then_registration_order() {
        let (mut host, controller) = host();
        timer(&mut host, 1, 20);
        timer(&mut host, 2, 10);
        timer(&mut host, 3, 10);

        controller.advance(Duration::from_millis(25));
        let fired: Vec<u32> = host
            .poll_callbacks()
            .into_iter()
            .map(|cb| cb.callback.0)
            .collect();
        assert_eq!(fired, vec![2, 3, 1]);
    }

    #[test]
    fn test_clear_timeout() {
        let (mut host, controller) = host();
        let handle = timer(&mut host, 1, 10);
        host.invoke(GLOBAL, "clearTimeout", vec![HostValue::Handle(handle)])
            .unwrap();
        controller.advance(Duration::from_millis(50));
        assert!(host.poll_callbacks().is_empty());
        assert_eq!(controller.active_timers(), 0);
    }

    #[test]
    fn test_run_pending_jumps_to_next_deadline() {
        let (mut host, controller) = host();
        timer(&mut host, 1, 30);
        assert!(host.run_pending());
        assert_eq!(controller.now(), Instant::from_millis(30));
        assert_eq!(host.pending_callbacks(), 1);
        host.poll_callbacks();
        assert!(!host.run_pending());
    }

    #[test]
    fn test_deferred_then_and_resolve() {
        let (mut host, controller) = host();
        let deferred = match host.invoke(GLOBAL, "createDeferred", vec![]).unwrap() {
            HostValue::Handle(handle) => handle,
            other => panic!("expected handle, got {other:?}"),
        };
        host.invoke(deferred, "then", vec![HostValue::Callback(CallbackId(9))])
            .unwrap();
        assert_eq!(controller.pending_deferreds(), vec![deferred]);

        assert!(controller.resolve(deferred, HostValue::Int(5)));
        assert!(!controller.resolve(deferred, HostValue::Int(6)));
        let fired = host.poll_callbacks();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].args, vec![HostValue::Int(5)]);

        // late subscribers see the settled value
        host.invoke(deferred, "then", vec![HostValue::Callback(CallbackId(10))])
            .unwrap();
        assert_eq!(host.poll_callbacks()[0].args, vec![HostValue::Int(5)]);
    }

    #[test]
    fn test_hardware_digital_write_reaches_model() {
        let (mut host, controller) = host();
        host.invoke(
            HARDWARE,
            "digitalWrite",
            vec![HostValue::Str("LED".into()), HostValue::Bool(true)],
        )
        .unwrap();
        let board = controller.board();
        let led = board.get("LED").unwrap();
        assert_eq!(controller.hardware().borrow().write_history(led), vec![true]);
        assert_eq!(
            controller.call_log(),
            vec!["hardware.digitalWrite".to_string()]
        );
    }

    #[test]
    fn test_unknown_pin_and_method_raise() {
        let (mut host, controller) = host();
        let err = host
            .invoke(HARDWARE, "digitalRead", vec![HostValue::Str("Z1".into())])
            .unwrap_err();
        assert_eq!(err.message, "pin Z1 not found");

        let err = host.invoke(GLOBAL, "fetch", vec![]).unwrap_err();
        assert_eq!(err.message, "global.fetch is not a function");

        controller.fail_method("now");
        assert!(host.invoke(GLOBAL, "now", vec![]).is_err());
        controller.heal_method("now");
        assert_eq!(
            host.invoke(GLOBAL, "now", vec![]).unwrap(),
            HostValue::Float(0.0)
        );
    }

    #[test]
    fn test_adopt_read_dispose() {
        let (mut host, controller) = host();
        let handle = host.adopt(HostValue::Str("hi".into())).unwrap();
        assert_eq!(host.read(handle).unwrap(), HostValue::Str("hi".into()));
        assert_eq!(controller.live_objects(), 1);
        host.dispose(handle);
        assert!(host.read(handle).is_err());
        assert_eq!(controller.live_objects(), 0);

        host.dispose(GLOBAL);
        assert_eq!(host.read(GLOBAL).unwrap(), HostValue::Handle(GLOBAL));
    }
}
