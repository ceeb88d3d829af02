//! # Supervisor
//!
//! Drives the scheduler one bounded quantum at a time and hands control
//! back to the host loop in between.
//!
//! A quantum ends when any of these holds:
//! - `max_steps_per_quantum` resumptions have run
//! - the wall-clock budget is spent
//! - nothing is ready (the host must make progress first)
//!
//! Task failures are captured and reported; only fatal scheduler errors
//! end the run.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use coop_scheduler::{
    ExitReason, Resume, Scheduler, SchedulerConfig, SchedulerError, Step, Task, TaskContext,
    TaskError,
};
use core_types::TaskId;
use hal::HalContext;
use host_bridge::{BridgeStats, SharedBridge};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How a quantum ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantumOutcome {
    /// Work is still ready; call again soon
    Yielded,
    /// Everything is waiting on the host
    Idle,
    /// Every task has finished
    Complete,
    /// The loop was stopped
    Stopped,
}

/// A task that ended with an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task: TaskId,
    pub name: String,
    pub message: String,
}

/// Summary of one quantum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantumReport {
    /// 1-based quantum number
    pub quantum: usize,
    /// Task resumptions performed
    pub steps: usize,
    /// Tasks that finished normally
    pub completed: Vec<TaskId>,
    /// Tasks that failed
    pub failures: Vec<TaskFailure>,
    /// Host callbacks whose callable failed
    pub callback_errors: usize,
    pub outcome: QuantumOutcome,
}

/// Totals from [`Supervisor::run_until_complete`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub quanta: usize,
    pub steps: usize,
    pub completed: Vec<TaskId>,
    pub failures: Vec<TaskFailure>,
    /// Set when the loop ended before every task finished
    pub stopped: bool,
}

/// The supervisor
pub struct Supervisor {
    config: SupervisorConfig,
    scheduler: Scheduler,
    hal: Option<HalContext>,
    quanta: usize,
    halted: bool,
    /// Failures collected by a run that ended with a fatal error
    halt_failures: Vec<TaskFailure>,
}

impl Supervisor {
    pub fn new(bridge: SharedBridge, config: SupervisorConfig) -> Self {
        Self::with_scheduler(Scheduler::new(bridge), config)
    }

    pub fn with_scheduler(scheduler: Scheduler, config: SupervisorConfig) -> Self {
        Self {
            config,
            scheduler,
            hal: None,
            quanta: 0,
            halted: false,
            halt_failures: Vec::new(),
        }
    }

    /// Attaches the HAL context reset by [`Supervisor::soft_reset`]
    pub fn with_hal(mut self, hal: HalContext) -> Self {
        self.hal = Some(hal);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn bridge(&self) -> &SharedBridge {
        self.scheduler.bridge()
    }

    pub fn hal(&self) -> Option<&HalContext> {
        self.hal.as_ref()
    }

    /// Marshalling-layer counters, for diagnostics
    pub fn bridge_stats(&self) -> BridgeStats {
        self.scheduler.bridge().stats()
    }

    pub fn spawn(&mut self, name: &str, body: impl Task + 'static) -> Result<TaskId, SupervisorError> {
        self.scheduler
            .spawn(name, body)
            .map_err(|err| SupervisorError::Setup(err.to_string()))
    }

    /// Like [`Supervisor::spawn`], for closures
    pub fn spawn_fn<F>(&mut self, name: &str, body: F) -> Result<TaskId, SupervisorError>
    where
        F: FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> + 'static,
    {
        self.spawn(name, body)
    }

    pub fn quanta(&self) -> usize {
        self.quanta
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Task failures a fatal error kept out of the returned reports
    pub fn take_halt_failures(&mut self) -> Vec<TaskFailure> {
        std::mem::take(&mut self.halt_failures)
    }

    /// Stops the loop; the next quantum reports `Stopped`
    pub fn stop(&mut self) {
        self.scheduler.stop();
    }

    /// Runs one quantum
    pub fn tick(&mut self) -> Result<QuantumReport, SupervisorError> {
        if self.halted {
            return Err(SupervisorError::Halted);
        }
        self.quanta += 1;
        let mut report = QuantumReport {
            quantum: self.quanta,
            steps: 0,
            completed: Vec::new(),
            failures: Vec::new(),
            callback_errors: 0,
            outcome: QuantumOutcome::Idle,
        };
        let started = Instant::now();

        while !self.scheduler.is_stopped() {
            let remaining = self.config.max_steps_per_quantum.saturating_sub(report.steps);
            if remaining == 0 || self.budget_spent(started) {
                break;
            }

            let pump = self.scheduler.bridge().pump();
            for err in &pump.errors {
                warn!(error = %err, "host callback failed");
            }
            report.callback_errors += pump.errors.len();

            let stepped = self.scheduler.step(remaining);
            self.collect_exits(&mut report);
            let step = match stepped {
                Ok(step) => step,
                Err(err) => {
                    self.halt_failures.append(&mut report.failures);
                    return Err(self.halt(err));
                }
            };
            report.steps += step.resumed;

            if step.resumed == 0 && step.woken == 0 && pump.dispatched == 0 {
                break;
            }
        }

        report.outcome = if self.scheduler.is_stopped() {
            QuantumOutcome::Stopped
        } else if self.scheduler.is_complete() {
            QuantumOutcome::Complete
        } else if self.scheduler.ready_len() > 0 {
            QuantumOutcome::Yielded
        } else {
            QuantumOutcome::Idle
        };
        debug!(
            quantum = report.quantum,
            steps = report.steps,
            completed = report.completed.len(),
            failures = report.failures.len(),
            outcome = ?report.outcome,
            "quantum finished"
        );
        Ok(report)
    }

    /// Runs quanta until every task finishes or the loop stops
    ///
    /// Between idle quanta the host event loop is asked to make progress;
    /// if it has nothing left to do the summary is returned with
    /// `stopped` set and the remaining tasks still suspended.
    pub fn run_until_complete(&mut self) -> Result<RunSummary, SupervisorError> {
        let mut summary = RunSummary::default();
        let mut quanta = 0;
        loop {
            let report = match self.tick() {
                Ok(report) => report,
                Err(err) => {
                    summary.failures.append(&mut self.halt_failures);
                    self.halt_failures = summary.failures;
                    return Err(err);
                }
            };
            quanta += 1;
            summary.quanta += 1;
            summary.steps += report.steps;
            summary.completed.extend(report.completed);
            summary.failures.extend(report.failures);

            match report.outcome {
                QuantumOutcome::Complete => break,
                QuantumOutcome::Stopped => {
                    summary.stopped = true;
                    break;
                }
                QuantumOutcome::Yielded => {}
                QuantumOutcome::Idle => {
                    if !self.scheduler.bridge().run_pending() {
                        info!(
                            active = self.scheduler.active_tasks(),
                            "host has no pending work; leaving tasks suspended"
                        );
                        summary.stopped = true;
                        break;
                    }
                }
            }

            if self.config.max_quanta > 0 && quanta >= self.config.max_quanta {
                warn!(limit = self.config.max_quanta, "quantum limit reached");
                return Err(SupervisorError::QuantumLimit {
                    limit: self.config.max_quanta,
                });
            }
        }
        info!(
            quanta = summary.quanta,
            steps = summary.steps,
            completed = summary.completed.len(),
            failures = summary.failures.len(),
            "run finished"
        );
        Ok(summary)
    }

    /// Ends every task and releases every pin, as a board soft reset does
    ///
    /// The supervisor is usable again afterwards, even after a fatal error.
    pub fn soft_reset(&mut self) {
        let aborted = self.scheduler.abort_all();
        let bridge = self.scheduler.bridge().clone();
        let config: SchedulerConfig = self.scheduler.config().clone();
        self.scheduler = Scheduler::with_config(bridge, config);
        if let Some(hal) = &self.hal {
            hal.reset();
        }
        self.quanta = 0;
        self.halted = false;
        self.halt_failures.clear();
        info!(aborted, "soft reset");
    }

    fn budget_spent(&self, started: Instant) -> bool {
        self.config
            .quantum_budget
            .is_some_and(|budget| started.elapsed() >= budget)
    }

    fn halt(&mut self, err: SchedulerError) -> SupervisorError {
        if err.is_fatal() {
            error!(error = %err, "fatal scheduler error; halting");
            self.halted = true;
            self.scheduler.stop();
        }
        SupervisorError::Fatal(err)
    }

    fn collect_exits(&mut self, report: &mut QuantumReport) {
        let mut failed = false;
        for exit in self.scheduler.take_exits() {
            match exit.reason {
                ExitReason::Normal => report.completed.push(exit.task),
                ExitReason::Cancelled => {}
                ExitReason::Failed(message) => {
                    failed = true;
                    report.failures.push(TaskFailure {
                        task: exit.task,
                        name: exit.name,
                        message,
                    });
                }
            }
        }
        if failed && self.config.stop_on_task_failure {
            warn!("task failed; stopping all tasks");
            self.scheduler.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::Duration;
    use coop_scheduler::WaitOn;
    use hal::BoardCatalog;
    use host_bridge::{SimController, SimHost};
    use std::cell::Cell;
    use std::rc::Rc;

    fn setup(config: SupervisorConfig) -> (Supervisor, SimController) {
        let host = SimHost::new(BoardCatalog::generic_metro());
        let controller = host.controller();
        let bridge = SharedBridge::new(Box::new(host));
        (Supervisor::new(bridge, config), controller)
    }

    fn spinner(turns: usize) -> impl FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> {
        let mut left = turns;
        move |_cx, _resume| {
            left -= 1;
            Ok(if left == 0 { Step::Done } else { Step::Yield })
        }
    }

    #[test]
    fn test_quantum_is_bounded() {
        let config = SupervisorConfig {
            max_steps_per_quantum: 4,
            ..SupervisorConfig::default()
        };
        let (mut supervisor, _controller) = setup(config);
        supervisor.spawn_fn("spin", spinner(10)).unwrap();

        let report = supervisor.tick().unwrap();
        assert_eq!(report.steps, 4);
        assert_eq!(report.outcome, QuantumOutcome::Yielded);

        supervisor.tick().unwrap();
        let report = supervisor.tick().unwrap();
        assert_eq!(report.steps, 2);
        assert_eq!(report.outcome, QuantumOutcome::Complete);
        assert_eq!(report.completed.len(), 1);
        assert_eq!(supervisor.quanta(), 3);
    }

    #[test]
    fn test_failure_does_not_abort_others() {
        let (mut supervisor, _controller) = setup(SupervisorConfig::default());
        let bad = supervisor
            .spawn_fn("bad", |_cx, _resume| Err(TaskError::failed("sensor missing")))
            .unwrap();
        let good = supervisor.spawn_fn("good", spinner(3)).unwrap();

        let report = supervisor.tick().unwrap();
        assert_eq!(report.outcome, QuantumOutcome::Complete);
        assert_eq!(report.completed, vec![good]);
        assert_eq!(
            report.failures,
            vec![TaskFailure {
                task: bad,
                name: "bad".to_string(),
                message: "sensor missing".to_string(),
            }]
        );
    }

    #[test]
    fn test_stop_on_task_failure() {
        let config = SupervisorConfig {
            stop_on_task_failure: true,
            ..SupervisorConfig::default()
        };
        let (mut supervisor, _controller) = setup(config);
        supervisor
            .spawn_fn("bad", |_cx, _resume| Err(TaskError::failed("boom")))
            .unwrap();
        supervisor.spawn_fn("spin", spinner(100)).unwrap();

        let report = supervisor.tick().unwrap();
        assert_eq!(report.outcome, QuantumOutcome::Stopped);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_deadlock_halts() {
        let (mut supervisor, _controller) = setup(SupervisorConfig::default());
        let event = supervisor.scheduler_mut().create_event();
        supervisor
            .spawn_fn("stuck", move |_cx, _resume| Ok(Step::Wait(WaitOn::Event(event))))
            .unwrap();

        let err = supervisor.tick().unwrap_err();
        assert!(matches!(err, SupervisorError::Fatal(SchedulerError::Deadlock { .. })));
        assert!(supervisor.is_halted());
        assert_eq!(supervisor.tick(), Err(SupervisorError::Halted));

        supervisor.soft_reset();
        assert!(!supervisor.is_halted());
        assert_eq!(supervisor.tick().unwrap().outcome, QuantumOutcome::Complete);
    }

    #[test]
    fn test_failure_survives_deadlock_in_same_quantum() {
        let (mut supervisor, _controller) = setup(SupervisorConfig::default());
        let event = supervisor.scheduler_mut().create_event();
        let bad = supervisor
            .spawn_fn("bad", |_cx, _resume| Err(TaskError::failed("boom")))
            .unwrap();
        supervisor
            .spawn_fn("stuck", move |_cx, _resume| Ok(Step::Wait(WaitOn::Event(event))))
            .unwrap();

        let err = supervisor.tick().unwrap_err();
        assert!(matches!(err, SupervisorError::Fatal(SchedulerError::Deadlock { .. })));
        assert_eq!(
            supervisor.take_halt_failures(),
            vec![TaskFailure {
                task: bad,
                name: "bad".to_string(),
                message: "boom".to_string(),
            }]
        );
        assert!(supervisor.take_halt_failures().is_empty());
    }

    #[test]
    fn test_run_keeps_failures_from_earlier_quanta_on_halt() {
        let config = SupervisorConfig {
            max_steps_per_quantum: 1,
            ..SupervisorConfig::default()
        };
        let (mut supervisor, _controller) = setup(config);
        let event = supervisor.scheduler_mut().create_event();
        supervisor
            .spawn_fn("bad", |_cx, _resume| Err(TaskError::failed("boom")))
            .unwrap();
        supervisor
            .spawn_fn("stuck", move |_cx, _resume| Ok(Step::Wait(WaitOn::Event(event))))
            .unwrap();

        assert!(supervisor.run_until_complete().is_err());
        let failures = supervisor.take_halt_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "bad");
    }

    #[test]
    fn test_idle_until_host_time_passes() {
        let (mut supervisor, controller) = setup(SupervisorConfig::default());
        let woke = Rc::new(Cell::new(false));
        let flag = Rc::clone(&woke);
        supervisor
            .spawn_fn("sleeper", move |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(30)))),
                _ => {
                    flag.set(true);
                    Ok(Step::Done)
                }
            })
            .unwrap();

        assert_eq!(supervisor.tick().unwrap().outcome, QuantumOutcome::Idle);
        assert_eq!(supervisor.tick().unwrap().outcome, QuantumOutcome::Idle);
        controller.advance(Duration::from_millis(30));
        assert_eq!(supervisor.tick().unwrap().outcome, QuantumOutcome::Complete);
        assert!(woke.get());
    }

    #[test]
    fn test_run_until_complete_drives_host_clock() {
        let (mut supervisor, controller) = setup(SupervisorConfig::default());
        supervisor
            .spawn_fn("sleeper", |_cx, resume| match resume.check()? {
                Resume::Start => Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(250)))),
                _ => Ok(Step::Done),
            })
            .unwrap();
        let summary = supervisor.run_until_complete().unwrap();
        assert!(!summary.stopped);
        assert_eq!(summary.completed.len(), 1);
        assert_eq!(controller.now(), core_types::Instant::from_millis(250));
    }

    #[test]
    fn test_quantum_limit() {
        let config = SupervisorConfig {
            max_steps_per_quantum: 1,
            max_quanta: 3,
            ..SupervisorConfig::default()
        };
        let (mut supervisor, _controller) = setup(config);
        supervisor.spawn_fn("spin", spinner(100)).unwrap();
        assert_eq!(
            supervisor.run_until_complete(),
            Err(SupervisorError::QuantumLimit { limit: 3 })
        );
    }

    #[test]
    fn test_report_serializes() {
        let (mut supervisor, _controller) = setup(SupervisorConfig::default());
        let report = supervisor.tick().unwrap();
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"outcome\":\"Complete\""));
    }
}
