//! # Core Types
//!
//! Fundamental types shared by every siliconbridge crate.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: tasks are named by typed ids, never by
//!   raw integers that could be confused with pin numbers or host handles.
//! - **Time is a value**: the scheduler and the host agree on time only
//!   through [`Instant`] and [`Duration`], never through a global clock.
//!
//! ## Key Types
//!
//! - [`TaskId`]: Unique identifier for a scheduled task
//! - [`LockId`], [`EventId`]: Scheduler synchronization primitives
//! - [`Instant`]: A point on the host's monotonic clock
//! - [`Duration`]: A span of host time

pub mod ids;
pub mod time;

pub use ids::{EventId, LockId, TaskId};
pub use time::{Duration, Instant};
