//! # Cooperative scheduler
//!
//! Single-threaded task scheduling driven by the host's event loop.
//!
//! ## Philosophy
//!
//! **Tasks give up control explicitly, and the host decides when time passes.**
//!
//! A task is a resumable state machine ([`Task`]). Every suspension point
//! is a [`Step`] value, and every resumption carries a [`Resume`] token,
//! so cancellation and timeouts reach a task the same way a normal wakeup
//! does.
//!
//! ## Pieces
//!
//! - [`Scheduler`]: ready queue, host timers, wakeup delivery, deadlock detection
//! - [`TaskContext`]: what a running task may ask of the scheduler
//! - [`SyncState`]: FIFO locks and events

pub mod error;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod timer;

pub use error::{SchedulerError, TaskError};
pub use scheduler::{
    ScheduleEvent, Scheduler, SchedulerConfig, StepReport, TaskExit, WaitKind, WakeCause,
};
pub use sync::SyncState;
pub use task::{ExitReason, Resume, Step, Task, TaskContext, TaskState, WaitOn};
pub use timer::{RegistrationId, TimerRole};
