//! # Tasks as explicit state machines
//!
//! A task is resumed by the scheduler with a [`Resume`] token saying why it
//! is running, and answers with a [`Step`] saying what it waits for next.
//! Nothing is captured implicitly: every suspension point is a value.
//!
//! ```text
//! Ready -> Running -> { Ready (yield), Suspended (wait), Done, Cancelled }
//! Suspended -> Ready   when the wake condition fires
//! ```

use crate::error::{SchedulerError, TaskError};
use crate::sync::SyncState;
use core_types::{Duration, EventId, LockId, TaskId};
use host_bridge::{ForeignRef, ForeignValue, SharedBridge};
use serde::{Deserialize, Serialize};

/// Scheduler-visible state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Ready,
    Running,
    Suspended,
    Done,
    Cancelled,
}

impl TaskState {
    /// Done and Cancelled are terminal
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Cancelled)
    }
}

/// Something a task can wait for
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOn {
    /// A host timer
    Sleep(Duration),
    /// Ownership of a lock
    Lock(LockId),
    /// An event being set
    Event(EventId),
    /// A host promise-like object settling
    Host(ForeignRef),
}

/// What a task does after a resumption
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Go to the back of the ready queue
    Yield,
    /// Suspend until the condition fires
    Wait(WaitOn),
    /// Suspend until the condition fires or the timeout elapses
    WaitTimeout(WaitOn, Duration),
    /// Finished normally
    Done,
}

/// Why a task is being resumed
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// First run
    Start,
    /// After a yield
    Continue,
    /// A sleep finished
    Elapsed,
    /// The task now owns the lock
    Acquired(LockId),
    /// The event was set
    Signalled(EventId),
    /// A host object settled with this value
    Resolved(ForeignValue),
    /// The wait ended abnormally
    Interrupted(TaskError),
}

impl Resume {
    /// Turns an interruption into an error, so bodies can use `?`
    pub fn check(self) -> Result<Resume, TaskError> {
        match self {
            Resume::Interrupted(err) => Err(err),
            other => Ok(other),
        }
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Normal,
    Cancelled,
    Failed(String),
}

/// A unit of cooperative work
pub trait Task {
    fn resume(&mut self, cx: &mut TaskContext<'_>, resume: Resume) -> Result<Step, TaskError>;
}

impl<F> Task for F
where
    F: FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError>,
{
    fn resume(&mut self, cx: &mut TaskContext<'_>, resume: Resume) -> Result<Step, TaskError> {
        self(cx, resume)
    }
}

/// Requests a task made while running; applied when it returns
#[derive(Default)]
pub(crate) struct Effects {
    pub(crate) spawned: Vec<(TaskId, String, Box<dyn Task>)>,
    pub(crate) cancelled: Vec<TaskId>,
    pub(crate) woken: Vec<(TaskId, Resume)>,
}

/// A running task's view of the scheduler
pub struct TaskContext<'a> {
    task: TaskId,
    bridge: &'a SharedBridge,
    sync: &'a mut SyncState,
    effects: &'a mut Effects,
    spawn_capacity: usize,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        task: TaskId,
        bridge: &'a SharedBridge,
        sync: &'a mut SyncState,
        effects: &'a mut Effects,
        spawn_capacity: usize,
    ) -> Self {
        Self {
            task,
            bridge,
            sync,
            effects,
            spawn_capacity,
        }
    }

    /// Id of the running task
    pub fn id(&self) -> TaskId {
        self.task
    }

    /// The bridge, for host calls made from task code
    pub fn bridge(&self) -> &SharedBridge {
        self.bridge
    }

    /// Starts a background task; it first runs after the current one yields
    pub fn spawn(&mut self, name: &str, body: impl Task + 'static) -> Result<TaskId, SchedulerError> {
        if self.effects.spawned.len() >= self.spawn_capacity {
            return Err(SchedulerError::TooManyTasks {
                limit: self.spawn_capacity,
            });
        }
        let id = TaskId::new();
        self.effects
            .spawned
            .push((id, name.to_string(), Box::new(body)));
        Ok(id)
    }

    /// Like [`TaskContext::spawn`], for closures
    pub fn spawn_fn<F>(&mut self, name: &str, body: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut(&mut TaskContext<'_>, Resume) -> Result<Step, TaskError> + 'static,
    {
        self.spawn(name, body)
    }

    /// Cancels another task (or this one, observed at its next resumption)
    pub fn cancel(&mut self, task: TaskId) {
        self.effects.cancelled.push(task);
    }

    pub fn create_lock(&mut self) -> LockId {
        self.sync.create_lock()
    }

    pub fn create_event(&mut self) -> EventId {
        self.sync.create_event()
    }

    /// Takes a lock without waiting
    pub fn try_lock(&mut self, lock: LockId) -> Result<bool, SchedulerError> {
        self.sync.try_acquire(lock, self.task)
    }

    /// Releases a lock this task holds; the next waiter is woken
    pub fn unlock(&mut self, lock: LockId) -> Result<(), SchedulerError> {
        if let Some(next) = self.sync.release(lock, self.task)? {
            self.effects.woken.push((next, Resume::Acquired(lock)));
        }
        Ok(())
    }

    /// Returns true if this task owns the lock
    pub fn holds(&self, lock: LockId) -> Result<bool, SchedulerError> {
        Ok(self.sync.owner(lock)? == Some(self.task))
    }

    /// Sets an event, waking every task waiting on it
    pub fn set_event(&mut self, event: EventId) -> Result<(), SchedulerError> {
        for waiter in self.sync.set(event)? {
            self.effects.woken.push((waiter, Resume::Signalled(event)));
        }
        Ok(())
    }

    pub fn clear_event(&mut self, event: EventId) -> Result<(), SchedulerError> {
        self.sync.clear(event)
    }

    pub fn is_set(&self, event: EventId) -> Result<bool, SchedulerError> {
        self.sync.is_set(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_passes_normal_resumes() {
        assert_eq!(Resume::Elapsed.check(), Ok(Resume::Elapsed));
        assert_eq!(
            Resume::Interrupted(TaskError::Timeout).check(),
            Err(TaskError::Timeout)
        );
    }

    #[test]
    fn test_finished_states() {
        assert!(TaskState::Done.is_finished());
        assert!(TaskState::Cancelled.is_finished());
        assert!(!TaskState::Suspended.is_finished());
    }
}
