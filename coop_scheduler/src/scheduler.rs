//! # Host-bridged cooperative scheduler
//!
//! ## Philosophy
//!
//! - **The host is the only clock**: sleeps and timeouts are host
//!   `setTimeout` registrations; the scheduler never waits by itself.
//! - **Determinism first**: FIFO ready queue; host wakeups are handled in
//!   delivery order, and timers delivered back to back wake in
//!   (deadline, registration) order.
//! - **No hidden yields**: a task runs until it returns a [`Step`].
//!
//! ## One step
//!
//! 1. Run the tasks that were ready when the step began, in FIFO order.
//!    Tasks made ready during the step (yields, lock handoffs, event sets,
//!    spawns) wait for the next step.
//! 2. Turn delivered host callbacks into wakeups.
//! 3. If nothing is ready, nothing is registered with the host and tasks
//!    are still suspended, report a deadlock.

use crate::error::{SchedulerError, TaskError};
use crate::sync::SyncState;
use crate::task::{Effects, ExitReason, Resume, Step, Task, TaskContext, TaskState, WaitOn};
use crate::timer::{
    Inbox, Ledger, Registration, RegistrationId, Source, TimerEntry, TimerHeap, TimerRole, Wakeup,
};
use core_types::{Duration, EventId, Instant, LockId, TaskId};
use host_bridge::{ForeignCallError, ForeignRef, ForeignValue, SharedBridge};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, error, info, trace, warn};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Applied to lock and event waits that carry no timeout of their own
    pub default_timeout: Option<Duration>,
    /// Maximum number of unfinished tasks
    pub max_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            max_tasks: 256,
        }
    }
}

/// Scheduling event for the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    TaskSpawned { task_id: TaskId, name: String },
    TaskSelected { task_id: TaskId },
    TaskSuspended { task_id: TaskId, on: WaitKind },
    TimerArmed { task_id: TaskId, deadline: Instant, seq: u64 },
    TaskWoken { task_id: TaskId, cause: WakeCause },
    TaskCancelled { task_id: TaskId },
    TaskExited { task_id: TaskId, reason: ExitReason },
}

/// Kind of wait, for the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitKind {
    Sleep,
    Lock,
    Event,
    Host,
}

/// Reason a suspended task became ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeCause {
    Elapsed,
    Acquired,
    Signalled,
    Resolved,
    TimedOut,
    Cancelled,
    Failed,
}

impl WakeCause {
    fn of(resume: &Resume) -> Self {
        match resume {
            Resume::Elapsed | Resume::Start | Resume::Continue => WakeCause::Elapsed,
            Resume::Acquired(_) => WakeCause::Acquired,
            Resume::Signalled(_) => WakeCause::Signalled,
            Resume::Resolved(_) => WakeCause::Resolved,
            Resume::Interrupted(TaskError::Timeout) => WakeCause::TimedOut,
            Resume::Interrupted(TaskError::Cancelled) => WakeCause::Cancelled,
            Resume::Interrupted(_) => WakeCause::Failed,
        }
    }
}

/// A task that finished, as reported to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskExit {
    pub task: TaskId,
    pub name: String,
    pub reason: ExitReason,
}

/// Counts from one [`Scheduler::step`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Task resumptions performed
    pub resumed: usize,
    /// Tasks made ready by host callbacks
    pub woken: usize,
    /// Stale host callbacks ignored
    pub stale: usize,
}

struct Waiting {
    on: WaitOn,
    registrations: Vec<RegistrationId>,
}

struct TaskRecord {
    name: String,
    state: TaskState,
    body: Option<Box<dyn Task>>,
    pending: Option<Resume>,
    waiting: Option<Waiting>,
    exit: Option<ExitReason>,
}

/// The cooperative scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    bridge: SharedBridge,
    tasks: HashMap<TaskId, TaskRecord>,
    /// Spawn order, for deterministic listings
    order: Vec<TaskId>,
    ready: VecDeque<TaskId>,
    timers: TimerHeap,
    ledger: Ledger,
    inbox: Inbox,
    sync: SyncState,
    next_seq: u64,
    stopped: bool,
    exits: Vec<TaskExit>,
    audit_log: Vec<ScheduleEvent>,
}

fn millis(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

impl Scheduler {
    pub fn new(bridge: SharedBridge) -> Self {
        Self::with_config(bridge, SchedulerConfig::default())
    }

    pub fn with_config(bridge: SharedBridge, config: SchedulerConfig) -> Self {
        Self {
            config,
            bridge,
            tasks: HashMap::new(),
            order: Vec::new(),
            ready: VecDeque::new(),
            timers: TimerHeap::default(),
            ledger: Ledger::default(),
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            sync: SyncState::new(),
            next_seq: 0,
            stopped: false,
            exits: Vec::new(),
            audit_log: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn bridge(&self) -> &SharedBridge {
        &self.bridge
    }

    /// Creates a task; it first runs with [`Resume::Start`]
    pub fn spawn(&mut self, name: &str, body: impl Task + 'static) -> Result<TaskId, SchedulerError> {
        if self.active_tasks() >= self.config.max_tasks {
            return Err(SchedulerError::TooManyTasks {
                limit: self.config.max_tasks,
            });
        }
        let id = TaskId::new();
        self.insert_task(id, name.to_string(), Box::new(body));
        Ok(id)
    }

    /// Like [`Scheduler::spawn`], for closures
    pub fn spawn_fn<F>(&mut self, name: &str, body: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> + 'static,
    {
        self.spawn(name, body)
    }

    fn insert_task(&mut self, id: TaskId, name: String, body: Box<dyn Task>) {
        debug!(task = %id, name = %name, "task spawned");
        self.audit_log.push(ScheduleEvent::TaskSpawned {
            task_id: id,
            name: name.clone(),
        });
        self.tasks.insert(
            id,
            TaskRecord {
                name,
                state: TaskState::Ready,
                body: Some(body),
                pending: Some(Resume::Start),
                waiting: None,
                exit: None,
            },
        );
        self.order.push(id);
        self.ready.push_back(id);
    }

    pub fn create_lock(&mut self) -> LockId {
        self.sync.create_lock()
    }

    pub fn create_event(&mut self) -> EventId {
        self.sync.create_event()
    }

    /// Sets an event from outside any task
    pub fn set_event(&mut self, event: EventId) -> Result<(), SchedulerError> {
        for waiter in self.sync.set(event)? {
            self.wake(waiter, Resume::Signalled(event));
        }
        Ok(())
    }

    pub fn clear_event(&mut self, event: EventId) -> Result<(), SchedulerError> {
        self.sync.clear(event)
    }

    pub fn is_set(&self, event: EventId) -> Result<bool, SchedulerError> {
        self.sync.is_set(event)
    }

    pub fn lock_owner(&self, lock: LockId) -> Result<Option<TaskId>, SchedulerError> {
        self.sync.owner(lock)
    }

    /// Cancels a task
    ///
    /// The task is Cancelled at once and its host registrations are
    /// disarmed. It is resumed one last time with
    /// `Resume::Interrupted(TaskError::Cancelled)`. A running task
    /// observes this at its next resumption. Returns false if the task had
    /// already finished.
    pub fn cancel(&mut self, task: TaskId) -> Result<bool, SchedulerError> {
        let record = self
            .tasks
            .get_mut(&task)
            .ok_or(SchedulerError::UnknownTask(task))?;
        if record.state.is_finished() {
            return Ok(false);
        }
        let was_running = record.state == TaskState::Running;
        record.state = TaskState::Cancelled;
        let superseded = record
            .pending
            .replace(Resume::Interrupted(TaskError::Cancelled));
        let waiting = record.waiting.take();
        info!(task = %task, name = %record.name, "task cancelled");
        self.audit_log
            .push(ScheduleEvent::TaskCancelled { task_id: task });
        if let Some(Resume::Resolved(value)) = superseded {
            self.release_value(value);
        }

        if was_running {
            return Ok(true);
        }
        if let Some(waiting) = waiting {
            self.abandon_wait(task, waiting);
        }
        if !self.ready.contains(&task) {
            self.ready.push_back(task);
        }
        Ok(true)
    }

    /// Ends every unfinished task without resuming it
    ///
    /// Used on soft reset. Returns the number of tasks aborted.
    pub fn abort_all(&mut self) -> usize {
        let unfinished: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| {
                self.tasks
                    .get(id)
                    .is_some_and(|record| !record.state.is_finished())
            })
            .collect();
        for &task in &unfinished {
            self.finish(task, ExitReason::Cancelled);
        }
        self.inbox.borrow_mut().clear();
        unfinished.len()
    }

    /// Stops the loop; no task runs after this
    pub fn stop(&mut self) {
        if !self.stopped {
            info!("scheduler stopped");
        }
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn task_state(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.get(&task).map(|record| record.state)
    }

    pub fn task_name(&self, task: TaskId) -> Option<&str> {
        self.tasks.get(&task).map(|record| record.name.as_str())
    }

    pub fn exit_reason(&self, task: TaskId) -> Option<&ExitReason> {
        self.tasks.get(&task).and_then(|record| record.exit.as_ref())
    }

    /// Every task ever spawned, in spawn order
    pub fn tasks(&self) -> &[TaskId] {
        &self.order
    }

    /// Tasks not yet Done or Cancelled
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .values()
            .filter(|record| !record.state.is_finished())
            .count()
    }

    /// Returns true once every task has finished
    pub fn is_complete(&self) -> bool {
        self.active_tasks() == 0
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Outstanding host registrations
    pub fn pending_registrations(&self) -> usize {
        self.ledger.len()
    }

    /// Armed timers
    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|entry| entry.deadline)
    }

    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    /// Drains the tasks that finished since the last call
    pub fn take_exits(&mut self) -> Vec<TaskExit> {
        std::mem::take(&mut self.exits)
    }

    /// Runs one scheduling step
    ///
    /// At most `budget` tasks are resumed. Fails only with a deadlock.
    pub fn step(&mut self, budget: usize) -> Result<StepReport, SchedulerError> {
        let mut report = StepReport::default();
        if self.stopped {
            return Ok(report);
        }
        let snapshot = self.ready.len().min(budget);
        for _ in 0..snapshot {
            let Some(task) = self.ready.pop_front() else {
                break;
            };
            if self.run_task(task) {
                report.resumed += 1;
            }
            if self.stopped {
                return Ok(report);
            }
        }
        let (woken, stale) = self.poll_wakeups();
        report.woken = woken;
        report.stale = stale;
        self.check_deadlock()?;
        trace!(
            resumed = report.resumed,
            woken = report.woken,
            ready = self.ready.len(),
            "step complete"
        );
        Ok(report)
    }

    /// Turns delivered host callbacks into ready tasks
    ///
    /// Wakeups are handled in the order the host delivered them, so the
    /// first side of a timeout race to arrive wins and the other goes
    /// stale. Adjacent timer wakeups are put in (deadline, seq) order.
    /// Returns (woken, stale).
    pub fn poll_wakeups(&mut self) -> (usize, usize) {
        let delivered: Vec<Wakeup> = self.inbox.borrow_mut().drain(..).collect();
        let mut timer_run: Vec<RegistrationId> = Vec::new();
        let mut woken = 0;
        let mut stale = 0;
        for wakeup in delivered {
            match wakeup {
                Wakeup::Timer(id) => timer_run.push(id),
                Wakeup::Surplus(values) => {
                    for value in values {
                        self.release_value(value);
                    }
                }
                Wakeup::Host(id, value) => {
                    let (w, s) = self.fire_timers(std::mem::take(&mut timer_run));
                    woken += w;
                    stale += s;
                    if self.ledger.get(id).is_none() {
                        self.release_value(value);
                        stale += 1;
                    } else if self.fire(id, Some(value)) {
                        woken += 1;
                    }
                }
            }
        }
        let (w, s) = self.fire_timers(timer_run);
        woken += w;
        stale += s;
        if stale > 0 {
            debug!(stale, "stale wakeups ignored");
        }
        (woken, stale)
    }

    /// Fires a run of delivered timers in (deadline, seq) order
    fn fire_timers(&mut self, run: Vec<RegistrationId>) -> (usize, usize) {
        let mut entries: Vec<TimerEntry> = Vec::with_capacity(run.len());
        let mut stale = 0;
        for id in run {
            match self.timers.get(id) {
                Some(entry) => entries.push(*entry),
                None => stale += 1,
            }
        }
        entries.sort();
        let mut woken = 0;
        for entry in entries {
            // an earlier wakeup in this run may have disarmed it
            if self.ledger.get(entry.registration).is_none() {
                stale += 1;
            } else if self.fire(entry.registration, None) {
                woken += 1;
            }
        }
        (woken, stale)
    }

    fn check_deadlock(&self) -> Result<(), SchedulerError> {
        if !self.ready.is_empty() || !self.ledger.is_empty() || !self.inbox.borrow().is_empty() {
            return Ok(());
        }
        let suspended: Vec<TaskId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.task_state(*id) == Some(TaskState::Suspended))
            .collect();
        if suspended.is_empty() {
            return Ok(());
        }
        error!(suspended = suspended.len(), "scheduler deadlock");
        Err(SchedulerError::Deadlock { suspended })
    }

    /// Resumes one task; returns false if there was nothing to run
    fn run_task(&mut self, task: TaskId) -> bool {
        let Some(record) = self.tasks.get_mut(&task) else {
            return false;
        };
        let Some(mut body) = record.body.take() else {
            return false;
        };
        let cancelled = record.state == TaskState::Cancelled;
        let resume = if cancelled {
            Resume::Interrupted(TaskError::Cancelled)
        } else {
            record.state = TaskState::Running;
            record.pending.take().unwrap_or(Resume::Continue)
        };
        self.audit_log
            .push(ScheduleEvent::TaskSelected { task_id: task });

        let capacity = self
            .config
            .max_tasks
            .saturating_sub(self.active_tasks());
        let mut effects = Effects::default();
        let outcome = {
            let mut cx = TaskContext::new(task, &self.bridge, &mut self.sync, &mut effects, capacity);
            body.resume(&mut cx, resume)
        };
        if let Some(record) = self.tasks.get_mut(&task) {
            record.body = Some(body);
        }

        self.apply(effects);
        self.settle(task, outcome, cancelled);
        true
    }

    fn apply(&mut self, effects: Effects) {
        for (id, name, body) in effects.spawned {
            self.insert_task(id, name, body);
        }
        for (waiter, resume) in effects.woken {
            self.wake(waiter, resume);
        }
        for target in effects.cancelled {
            if let Err(err) = self.cancel(target) {
                warn!(task = %target, error = %err, "cancel request ignored");
            }
        }
    }

    fn settle(&mut self, task: TaskId, outcome: Result<Step, TaskError>, observed_cancel: bool) {
        let Some(state) = self.task_state(task) else {
            return;
        };
        if observed_cancel {
            self.finish(task, ExitReason::Cancelled);
            return;
        }
        if state == TaskState::Cancelled {
            // cancelled while running: finish now or at the next resumption
            match outcome {
                Ok(Step::Done) | Err(_) => self.finish(task, ExitReason::Cancelled),
                Ok(_) => {
                    if !self.ready.contains(&task) {
                        self.ready.push_back(task);
                    }
                }
            }
            return;
        }
        match outcome {
            Ok(Step::Yield) => self.make_ready(task, Resume::Continue),
            Ok(Step::Done) => self.finish(task, ExitReason::Normal),
            Ok(Step::Wait(on)) => {
                let timeout = match on {
                    WaitOn::Lock(_) | WaitOn::Event(_) => self.config.default_timeout,
                    _ => None,
                };
                self.suspend(task, on, timeout);
            }
            Ok(Step::WaitTimeout(on, timeout)) => self.suspend(task, on, Some(timeout)),
            Err(TaskError::Cancelled) => self.finish(task, ExitReason::Cancelled),
            Err(err) => self.finish(task, ExitReason::Failed(err.to_string())),
        }
    }

    fn make_ready(&mut self, task: TaskId, resume: Resume) {
        if let Some(record) = self.tasks.get_mut(&task) {
            record.state = TaskState::Ready;
            record.pending = Some(resume);
            self.ready.push_back(task);
        }
    }

    fn suspend(&mut self, task: TaskId, on: WaitOn, timeout: Option<Duration>) {
        let mut registrations = Vec::new();
        let kind = match &on {
            WaitOn::Sleep(delay) => {
                match self.arm_timer(task, *delay, TimerRole::Sleep) {
                    Ok(id) => registrations.push(id),
                    Err(err) => return self.make_ready(task, Resume::Interrupted(err.into())),
                }
                WaitKind::Sleep
            }
            WaitOn::Lock(lock) => {
                match self.sync.try_acquire(*lock, task) {
                    Ok(true) => return self.make_ready(task, Resume::Acquired(*lock)),
                    Ok(false) => {}
                    Err(err) => return self.make_ready(task, Resume::Interrupted(err.into())),
                }
                if let Err(err) = self.sync.enqueue_waiter(*lock, task) {
                    return self.make_ready(task, Resume::Interrupted(err.into()));
                }
                WaitKind::Lock
            }
            WaitOn::Event(event) => {
                match self.sync.is_set(*event) {
                    Ok(true) => return self.make_ready(task, Resume::Signalled(*event)),
                    Ok(false) => {}
                    Err(err) => return self.make_ready(task, Resume::Interrupted(err.into())),
                }
                if let Err(err) = self.sync.add_event_waiter(*event, task) {
                    return self.make_ready(task, Resume::Interrupted(err.into()));
                }
                WaitKind::Event
            }
            WaitOn::Host(deferred) => {
                match self.subscribe(task, *deferred) {
                    Ok(id) => registrations.push(id),
                    Err(err) => return self.make_ready(task, Resume::Interrupted(err.into())),
                }
                WaitKind::Host
            }
        };

        if let Some(timeout) = timeout {
            match self.arm_timer(task, timeout, TimerRole::Timeout) {
                Ok(id) => registrations.push(id),
                Err(err) => {
                    self.abandon_wait(task, Waiting { on, registrations });
                    return self.make_ready(task, Resume::Interrupted(err.into()));
                }
            }
        }

        if let Some(record) = self.tasks.get_mut(&task) {
            record.state = TaskState::Suspended;
            record.waiting = Some(Waiting { on, registrations });
        }
        self.audit_log.push(ScheduleEvent::TaskSuspended {
            task_id: task,
            on: kind,
        });
    }

    /// Host time, as reported by the global `now`
    fn host_now(&self) -> Result<Instant, ForeignCallError> {
        let global = self.bridge.global();
        let now = self.bridge.call(global, "now", &[])?;
        let ms = now.as_float().ok_or(ForeignCallError::TypeMismatch {
            expected: "number",
            found: now.kind(),
        })?;
        Ok(Instant::from_nanos((ms.max(0.0) * 1_000_000.0) as u64))
    }

    fn arm_timer(
        &mut self,
        task: TaskId,
        delay: Duration,
        role: TimerRole,
    ) -> Result<RegistrationId, ForeignCallError> {
        let now = self.host_now()?;
        let id = self.ledger.reserve();
        let inbox = Rc::clone(&self.inbox);
        let callback = self.bridge.register_callable(move |args| {
            let mut inbox = inbox.borrow_mut();
            if !args.is_empty() {
                inbox.push_back(Wakeup::Surplus(args.to_vec()));
            }
            inbox.push_back(Wakeup::Timer(id));
            Ok(ForeignValue::None)
        });

        let global = self.bridge.global();
        let armed = self
            .bridge
            .call(
                global,
                "setTimeout",
                &[ForeignValue::Callable(callback), ForeignValue::Float(millis(delay))],
            )
            .and_then(|handle| {
                handle.as_object().ok_or(ForeignCallError::TypeMismatch {
                    expected: "object",
                    found: handle.kind(),
                })
            });
        let handle = match armed {
            Ok(handle) => handle,
            Err(err) => {
                let _ = self.bridge.unregister_callable(callback);
                return Err(err);
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        let deadline = now + delay;
        self.timers.push(TimerEntry {
            deadline,
            seq,
            task,
            registration: id,
        });
        self.ledger.insert(
            id,
            Registration {
                task,
                callback,
                source: Source::Timer { handle, role },
            },
        );
        debug!(task = %task, delay_ms = delay.as_millis(), seq, ?role, "timer armed");
        self.audit_log.push(ScheduleEvent::TimerArmed {
            task_id: task,
            deadline,
            seq,
        });
        Ok(id)
    }

    /// Subscribes to a host promise-like object with `then`
    fn subscribe(&mut self, task: TaskId, deferred: ForeignRef) -> Result<RegistrationId, ForeignCallError> {
        self.bridge.retain(deferred)?;
        let id = self.ledger.reserve();
        let inbox = Rc::clone(&self.inbox);
        let callback = self.bridge.register_callable(move |args| {
            let value = args.first().cloned().unwrap_or(ForeignValue::None);
            let mut inbox = inbox.borrow_mut();
            if args.len() > 1 {
                inbox.push_back(Wakeup::Surplus(args[1..].to_vec()));
            }
            inbox.push_back(Wakeup::Host(id, value));
            Ok(ForeignValue::None)
        });
        if let Err(err) = self
            .bridge
            .call(deferred, "then", &[ForeignValue::Callable(callback)])
        {
            let _ = self.bridge.unregister_callable(callback);
            let _ = self.bridge.release(deferred);
            return Err(err);
        }
        self.ledger.insert(
            id,
            Registration {
                task,
                callback,
                source: Source::Host { deferred },
            },
        );
        debug!(task = %task, reference = deferred.id(), "host wait registered");
        Ok(id)
    }

    /// Drops a registration, cancelling the host side if it has not fired
    fn disarm(&mut self, id: RegistrationId, fired: bool) -> Option<Registration> {
        let registration = self.ledger.remove(id)?;
        match &registration.source {
            Source::Timer { handle, .. } => {
                self.timers.remove(id);
                if !fired {
                    let global = self.bridge.global();
                    if let Err(err) = self.bridge.call(
                        global,
                        "clearTimeout",
                        &[ForeignValue::Object(*handle)],
                    ) {
                        warn!(error = %err, "clearTimeout failed");
                    }
                }
                if let Err(err) = self.bridge.release(*handle) {
                    warn!(error = %err, "timer handle release failed");
                }
            }
            Source::Host { deferred } => {
                if let Err(err) = self.bridge.release(*deferred) {
                    warn!(error = %err, "deferred release failed");
                }
            }
        }
        if let Err(err) = self.bridge.unregister_callable(registration.callback) {
            warn!(error = %err, "callback unregister failed");
        }
        Some(registration)
    }

    /// Consumes a fired registration and wakes its task
    fn fire(&mut self, id: RegistrationId, value: Option<ForeignValue>) -> bool {
        let Some(registration) = self.disarm(id, true) else {
            if let Some(value) = value {
                self.release_value(value);
            }
            return false;
        };
        let resume = match (&registration.source, value) {
            (Source::Timer { role: TimerRole::Sleep, .. }, _) => Resume::Elapsed,
            (Source::Timer { role: TimerRole::Timeout, .. }, _) => {
                Resume::Interrupted(TaskError::Timeout)
            }
            (Source::Host { .. }, value) => Resume::Resolved(value.unwrap_or(ForeignValue::None)),
        };
        if let Some(record) = self.tasks.get_mut(&registration.task) {
            if let Some(waiting) = record.waiting.as_mut() {
                waiting.registrations.retain(|other| *other != id);
            }
        }
        self.wake(registration.task, resume)
    }

    fn release_value(&self, value: ForeignValue) {
        if let ForeignValue::Object(reference) = value {
            if let Err(err) = self.bridge.release(reference) {
                warn!(error = %err, "dropped wakeup value release failed");
            }
        }
    }

    /// Clears whatever a task was waiting on
    fn abandon_wait(&mut self, task: TaskId, waiting: Waiting) {
        for id in waiting.registrations {
            self.disarm(id, false);
        }
        if matches!(waiting.on, WaitOn::Lock(_) | WaitOn::Event(_)) {
            self.sync.remove_waiter(task);
        }
    }

    /// Moves a suspended task to the ready queue; the race's loser is disarmed
    fn wake(&mut self, task: TaskId, resume: Resume) -> bool {
        let Some(record) = self.tasks.get_mut(&task) else {
            return false;
        };
        if record.state != TaskState::Suspended {
            match resume {
                Resume::Resolved(value) => self.release_value(value),
                // a handoff nobody can take moves on down the queue
                Resume::Acquired(lock) => {
                    if let Ok(Some(next)) = self.sync.release(lock, task) {
                        self.wake(next, Resume::Acquired(lock));
                    }
                }
                _ => {}
            }
            return false;
        }
        let waiting = record.waiting.take();
        if let Some(waiting) = waiting {
            self.abandon_wait(task, waiting);
        }
        let cause = WakeCause::of(&resume);
        trace!(task = %task, ?cause, "task woken");
        self.audit_log.push(ScheduleEvent::TaskWoken {
            task_id: task,
            cause,
        });
        self.make_ready(task, resume);
        true
    }

    fn finish(&mut self, task: TaskId, reason: ExitReason) {
        let Some(record) = self.tasks.get_mut(&task) else {
            return;
        };
        record.state = if reason == ExitReason::Cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Done
        };
        record.body = None;
        let pending = record.pending.take();
        record.exit = Some(reason.clone());
        let name = record.name.clone();
        let waiting = record.waiting.take();

        if let Some(Resume::Resolved(value)) = pending {
            self.release_value(value);
        }

        if let Some(waiting) = waiting {
            self.abandon_wait(task, waiting);
        }
        for id in self.ledger.owned_by(task) {
            self.disarm(id, false);
        }
        self.sync.remove_waiter(task);
        self.ready.retain(|&queued| queued != task);
        for (lock, next) in self.sync.release_all(task) {
            debug!(lock = %lock, task = %next, "lock handed off on exit");
            self.wake(next, Resume::Acquired(lock));
        }

        match &reason {
            ExitReason::Normal => debug!(task = %task, name = %name, "task done"),
            ExitReason::Cancelled => debug!(task = %task, name = %name, "task finished cancelled"),
            ExitReason::Failed(message) => {
                warn!(task = %task, name = %name, error = %message, "task failed")
            }
        }
        self.audit_log.push(ScheduleEvent::TaskExited {
            task_id: task,
            reason: reason.clone(),
        });
        self.exits.push(TaskExit { task, name, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::BoardCatalog;
    use host_bridge::{SimController, SimHost};
    use std::cell::Cell;

    fn setup() -> (Scheduler, SimController) {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));
        (Scheduler::new(bridge), controller)
    }

    /// Pumps host callbacks and steps until nothing is ready
    fn settle(scheduler: &mut Scheduler) -> Result<(), SchedulerError> {
        loop {
            scheduler.bridge().pump();
            let report = scheduler.step(usize::MAX)?;
            if report.resumed == 0 && report.woken == 0 && scheduler.ready_len() == 0 {
                return Ok(());
            }
        }
    }

    fn sleeper(
        delay: Duration,
        log: Rc<RefCell<Vec<&'static str>>>,
        label: &'static str,
    ) -> impl FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> {
        move |_cx, resume| match resume.check()? {
            Resume::Start => Ok(Step::Wait(WaitOn::Sleep(delay))),
            _ => {
                log.borrow_mut().push(label);
                Ok(Step::Done)
            }
        }
    }

    #[test]
    fn test_yield_runs_fifo() {
        let (mut scheduler, _controller) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        for label in ["a", "b"] {
            let log = Rc::clone(&log);
            let mut turns = 0;
            scheduler
                .spawn_fn(label, move |_cx, _resume| {
                    log.borrow_mut().push(label);
                    turns += 1;
                    Ok(if turns < 2 { Step::Yield } else { Step::Done })
                })
                .unwrap();
        }
        settle(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "a", "b"]);
        assert!(scheduler.is_complete());
    }

    #[test]
    fn test_timer_order() {
        let (mut scheduler, controller) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        scheduler
            .spawn_fn("slow", sleeper(Duration::from_millis(100), Rc::clone(&log), "slow"))
            .unwrap();
        scheduler
            .spawn_fn("fast", sleeper(Duration::from_millis(50), Rc::clone(&log), "fast"))
            .unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(scheduler.armed_timers(), 2);
        assert_eq!(scheduler.next_deadline(), Some(Instant::from_millis(50)));

        controller.advance(Duration::from_millis(100));
        settle(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec!["fast", "slow"]);
        assert_eq!(scheduler.pending_registrations(), 0);
        assert_eq!(scheduler.bridge().stats().registered_callables, 0);
    }

    #[test]
    fn test_equal_deadlines_fire_in_registration_order() {
        let (mut scheduler, controller) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        for label in ["first", "second", "third"] {
            scheduler
                .spawn_fn(label, sleeper(Duration::from_millis(10), Rc::clone(&log), label))
                .unwrap();
        }
        settle(&mut scheduler).unwrap();
        controller.advance(Duration::from_millis(10));
        settle(&mut scheduler).unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_cancel_mid_sleep_is_observed() {
        let (mut scheduler, controller) = setup();
        let seen = Rc::new(RefCell::new(None));
        let observed = Rc::clone(&seen);
        let task = scheduler
            .spawn_fn("sleeper", move |_cx, resume| match resume {
                Resume::Start => Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(50)))),
                other => {
                    *observed.borrow_mut() = Some(other.clone());
                    other.check()?;
                    Ok(Step::Done)
                }
            })
            .unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(scheduler.task_state(task), Some(TaskState::Suspended));

        assert!(scheduler.cancel(task).unwrap());
        assert_eq!(scheduler.task_state(task), Some(TaskState::Cancelled));
        assert_eq!(controller.active_timers(), 0);

        settle(&mut scheduler).unwrap();
        assert_eq!(
            *seen.borrow(),
            Some(Resume::Interrupted(TaskError::Cancelled))
        );
        assert_eq!(scheduler.exit_reason(task), Some(&ExitReason::Cancelled));
        assert!(!scheduler.cancel(task).unwrap());

        controller.advance(Duration::from_millis(50));
        settle(&mut scheduler).unwrap();
        assert_eq!(scheduler.bridge().stats().live_references, 1);
    }

    #[test]
    fn test_lock_handoff_and_timeout() {
        let (mut scheduler, controller) = setup();
        let lock = scheduler.create_lock();
        let outcome = Rc::new(RefCell::new(Vec::new()));

        let log = Rc::clone(&outcome);
        scheduler
            .spawn_fn("holder", move |cx, resume| match resume.check()? {
                Resume::Start => {
                    assert!(cx.try_lock(lock)?);
                    Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(30))))
                }
                _ => {
                    log.borrow_mut().push("holder done");
                    cx.unlock(lock)?;
                    Ok(Step::Done)
                }
            })
            .unwrap();

        let log = Rc::clone(&outcome);
        scheduler
            .spawn_fn("impatient", move |_cx, resume| match resume {
                Resume::Start => Ok(Step::WaitTimeout(WaitOn::Lock(lock), Duration::from_millis(10))),
                Resume::Interrupted(TaskError::Timeout) => {
                    log.borrow_mut().push("impatient timed out");
                    Ok(Step::Done)
                }
                other => panic!("unexpected resume {other:?}"),
            })
            .unwrap();

        let log = Rc::clone(&outcome);
        scheduler
            .spawn_fn("patient", move |cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Lock(lock))),
                Resume::Acquired(acquired) => {
                    assert_eq!(acquired, lock);
                    assert!(cx.holds(lock)?);
                    log.borrow_mut().push("patient acquired");
                    Ok(Step::Done)
                }
                other => panic!("unexpected resume {other:?}"),
            })
            .unwrap();

        settle(&mut scheduler).unwrap();
        controller.advance(Duration::from_millis(10));
        settle(&mut scheduler).unwrap();
        controller.advance(Duration::from_millis(20));
        settle(&mut scheduler).unwrap();

        assert_eq!(
            *outcome.borrow(),
            vec!["impatient timed out", "holder done", "patient acquired"]
        );
        assert_eq!(scheduler.lock_owner(lock).unwrap(), None);
        assert!(scheduler.is_complete());
    }

    #[test]
    fn test_lock_released_when_owner_exits() {
        let (mut scheduler, _controller) = setup();
        let lock = scheduler.create_lock();
        scheduler
            .spawn_fn("owner", move |cx, resume| match resume {
                Resume::Start => {
                    cx.try_lock(lock)?;
                    Ok(Step::Yield)
                }
                _ => Err(TaskError::failed("boom")),
            })
            .unwrap();
        let got = Rc::new(Cell::new(false));
        let flag = Rc::clone(&got);
        scheduler
            .spawn_fn("waiter", move |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Lock(lock))),
                _ => {
                    flag.set(true);
                    Ok(Step::Done)
                }
            })
            .unwrap();
        scheduler.step(usize::MAX).unwrap();
        assert_eq!(scheduler.lock_owner(lock).unwrap(), Some(owner_id(&scheduler)));
        settle(&mut scheduler).unwrap();
        assert!(got.get());
        assert_eq!(scheduler.lock_owner(lock).unwrap(), None);

        let exits = scheduler.take_exits();
        assert_eq!(exits[0].reason, ExitReason::Failed("boom".to_string()));
        assert_eq!(exits[1].reason, ExitReason::Normal);
    }

    fn owner_id(scheduler: &Scheduler) -> TaskId {
        scheduler.tasks()[0]
    }

    #[test]
    fn test_event_wakes_all_waiters() {
        let (mut scheduler, _controller) = setup();
        let event = scheduler.create_event();
        let woken = Rc::new(Cell::new(0));
        for name in ["w1", "w2"] {
            let woken = Rc::clone(&woken);
            scheduler
                .spawn_fn(name, move |_cx, resume| match resume.check()? {
                    Resume::Start => Ok(Step::Wait(WaitOn::Event(event))),
                    Resume::Signalled(_) => {
                        woken.set(woken.get() + 1);
                        Ok(Step::Done)
                    }
                    other => panic!("unexpected resume {other:?}"),
                })
                .unwrap();
        }
        scheduler
            .spawn_fn("setter", move |cx, _resume| {
                cx.set_event(event)?;
                Ok(Step::Done)
            })
            .unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(woken.get(), 2);
        assert!(scheduler.is_set(event).unwrap());
    }

    #[test]
    fn test_deadlock_detected() {
        let (mut scheduler, _controller) = setup();
        let event = scheduler.create_event();
        let task = scheduler
            .spawn_fn("stuck", move |_cx, _resume| Ok(Step::Wait(WaitOn::Event(event))))
            .unwrap();
        let err = settle(&mut scheduler).unwrap_err();
        assert_eq!(err, SchedulerError::Deadlock { suspended: vec![task] });
        assert!(err.is_fatal());
    }

    #[test]
    fn test_default_timeout_prevents_deadlock() {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));
        let config = SchedulerConfig {
            default_timeout: Some(Duration::from_millis(5)),
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::with_config(bridge, config);
        let event = scheduler.create_event();
        let task = scheduler
            .spawn_fn("waits", move |_cx, resume| match resume {
                Resume::Start => Ok(Step::Wait(WaitOn::Event(event))),
                other => {
                    other.check()?;
                    Ok(Step::Done)
                }
            })
            .unwrap();
        settle(&mut scheduler).unwrap();
        controller.advance(Duration::from_millis(5));
        settle(&mut scheduler).unwrap();
        assert_eq!(
            scheduler.exit_reason(task),
            Some(&ExitReason::Failed("Timed out".to_string()))
        );
    }

    #[test]
    fn test_host_wait_resolves() {
        let (mut scheduler, controller) = setup();
        let bridge = scheduler.bridge().clone();
        let global = bridge.global();
        let deferred = bridge
            .call(global, "createDeferred", &[])
            .unwrap()
            .as_object()
            .unwrap();
        let result = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&result);
        scheduler
            .spawn_fn("awaits", move |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Host(deferred))),
                Resume::Resolved(value) => {
                    *slot.borrow_mut() = Some(value);
                    Ok(Step::Done)
                }
                other => panic!("unexpected resume {other:?}"),
            })
            .unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(bridge.ref_count(deferred), Some(2));

        let pending = controller.pending_deferreds();
        assert!(controller.resolve(pending[0], host_bridge::HostValue::Int(7)));
        settle(&mut scheduler).unwrap();
        assert_eq!(*result.borrow(), Some(ForeignValue::Int(7)));
        assert_eq!(bridge.ref_count(deferred), Some(1));
        bridge.release(deferred).unwrap();
    }

    fn deferred(bridge: &SharedBridge) -> ForeignRef {
        let global = bridge.global();
        bridge
            .call(global, "createDeferred", &[])
            .unwrap()
            .as_object()
            .unwrap()
    }

    #[test]
    fn test_cancel_releases_resolved_object() {
        let (mut scheduler, controller) = setup();
        let bridge = scheduler.bridge().clone();
        let awaited = deferred(&bridge);
        let payload = deferred(&bridge);
        let task = scheduler
            .spawn_fn("awaits", move |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Host(awaited))),
                other => panic!("unexpected resume {other:?}"),
            })
            .unwrap();
        settle(&mut scheduler).unwrap();

        let pending = controller.pending_deferreds();
        assert!(controller.resolve(pending[0], host_bridge::HostValue::Handle(pending[1])));
        bridge.pump();
        scheduler.step(usize::MAX).unwrap();
        // woken with the payload, not yet run
        assert_eq!(bridge.ref_count(payload), Some(2));

        assert!(scheduler.cancel(task).unwrap());
        settle(&mut scheduler).unwrap();
        assert!(scheduler.is_complete());
        assert_eq!(bridge.ref_count(payload), Some(1));
        bridge.release(payload).unwrap();
        bridge.release(awaited).unwrap();
        assert_eq!(bridge.stats().live_references, 1);
    }

    #[test]
    fn test_extra_host_arguments_are_released() {
        let (mut scheduler, controller) = setup();
        let bridge = scheduler.bridge().clone();
        let awaited = deferred(&bridge);
        let payload = deferred(&bridge);
        let result = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&result);
        let task = scheduler
            .spawn_fn("awaits", move |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Host(awaited))),
                Resume::Resolved(value) => {
                    *slot.borrow_mut() = Some(value);
                    Ok(Step::Done)
                }
                other => panic!("unexpected resume {other:?}"),
            })
            .unwrap();
        settle(&mut scheduler).unwrap();

        let registration = scheduler.ledger.owned_by(task)[0];
        let callback = scheduler.ledger.get(registration).unwrap().callback;
        let handle = controller.pending_deferreds()[1];
        controller.fire_callback(
            callback,
            vec![
                host_bridge::HostValue::Int(7),
                host_bridge::HostValue::Handle(handle),
            ],
        );
        settle(&mut scheduler).unwrap();

        assert_eq!(*result.borrow(), Some(ForeignValue::Int(7)));
        assert_eq!(bridge.ref_count(payload), Some(1));
        bridge.release(payload).unwrap();
        bridge.release(awaited).unwrap();
        assert_eq!(bridge.stats().live_references, 1);
    }

    #[test]
    fn test_spawn_from_task_runs_next_step() {
        let (mut scheduler, _controller) = setup();
        let log = Rc::new(RefCell::new(Vec::new()));
        let parent_log = Rc::clone(&log);
        scheduler
            .spawn_fn("parent", move |cx, resume| match resume.check()? {
                Resume::Start => {
                    let child_log = Rc::clone(&parent_log);
                    cx.spawn_fn("child", move |_cx, _resume| {
                        child_log.borrow_mut().push("child");
                        Ok(Step::Done)
                    })?;
                    parent_log.borrow_mut().push("parent start");
                    Ok(Step::Yield)
                }
                _ => {
                    parent_log.borrow_mut().push("parent resumed");
                    Ok(Step::Done)
                }
            })
            .unwrap();
        settle(&mut scheduler).unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["parent start", "child", "parent resumed"]
        );
    }

    #[test]
    fn test_max_tasks() {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let bridge = SharedBridge::new(Box::new(host));
        let config = SchedulerConfig {
            max_tasks: 1,
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::with_config(bridge, config);
        scheduler.spawn_fn("one", |_cx, _r| Ok(Step::Done)).unwrap();
        assert_eq!(
            scheduler.spawn_fn("two", |_cx, _r| Ok(Step::Done)),
            Err(SchedulerError::TooManyTasks { limit: 1 })
        );
    }

    #[test]
    fn test_stop_halts_running() {
        let (mut scheduler, _controller) = setup();
        let runs = Rc::new(Cell::new(0));
        let counter = Rc::clone(&runs);
        scheduler
            .spawn_fn("spinner", move |_cx, _resume| {
                counter.set(counter.get() + 1);
                Ok(Step::Yield)
            })
            .unwrap();
        scheduler.step(10).unwrap();
        scheduler.stop();
        scheduler.step(10).unwrap();
        assert_eq!(runs.get(), 1);
        assert!(scheduler.is_stopped());
    }

    #[test]
    fn test_audit_log_records_lifecycle() {
        let (mut scheduler, _controller) = setup();
        let task = scheduler.spawn_fn("once", |_cx, _r| Ok(Step::Done)).unwrap();
        settle(&mut scheduler).unwrap();
        let log = scheduler.audit_log();
        assert!(matches!(log[0], ScheduleEvent::TaskSpawned { task_id, .. } if task_id == task));
        assert_eq!(log[1], ScheduleEvent::TaskSelected { task_id: task });
        assert_eq!(
            log[2],
            ScheduleEvent::TaskExited {
                task_id: task,
                reason: ExitReason::Normal
            }
        );
        let json = serde_json::to_string(&log[2]).unwrap();
        assert!(json.contains("TaskExited"));
    }
}
