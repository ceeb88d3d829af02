//! Timer heap and the ledger of host registrations
//!
//! Every wakeup source the scheduler arms with the host (a `setTimeout` or
//! a `then` on a promise-like object) gets a [`RegistrationId`] and an entry
//! in the [`Ledger`]. Host callbacks only push a [`Wakeup`] into the inbox;
//! the scheduler decides later what it means. A wakeup whose registration
//! is gone (disarmed by cancellation or a lost timeout race) is stale and
//! ignored.

use core_types::{Instant, TaskId};
use host_bridge::{CallbackId, ForeignRef, ForeignValue};
use std::cell::RefCell;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::rc::Rc;

/// Identifies one armed wakeup source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

/// What a host callback reported
#[derive(Debug, Clone, PartialEq)]
pub enum Wakeup {
    Timer(RegistrationId),
    Host(RegistrationId, ForeignValue),
    /// Callback arguments nobody will read; released when polled
    Surplus(Vec<ForeignValue>),
}

/// Where host callbacks deliver wakeups
pub type Inbox = Rc<RefCell<VecDeque<Wakeup>>>;

/// Why a timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRole {
    Sleep,
    Timeout,
}

/// A scheduled wakeup, ordered by deadline then registration sequence
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    pub deadline: Instant,
    pub seq: u64,
    pub task: TaskId,
    pub registration: RegistrationId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// Min-heap of armed timers
#[derive(Debug, Default)]
pub struct TimerHeap {
    heap: BinaryHeap<Reverse<TimerEntry>>,
}

impl TimerHeap {
    pub fn push(&mut self, entry: TimerEntry) {
        self.heap.push(Reverse(entry));
    }

    /// Earliest armed timer
    pub fn peek(&self) -> Option<&TimerEntry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    pub fn get(&self, registration: RegistrationId) -> Option<&TimerEntry> {
        self.heap
            .iter()
            .map(|Reverse(entry)| entry)
            .find(|entry| entry.registration == registration)
    }

    pub fn remove(&mut self, registration: RegistrationId) -> Option<TimerEntry> {
        let found = self
            .heap
            .iter()
            .find(|Reverse(entry)| entry.registration == registration)
            .map(|Reverse(entry)| *entry);
        if found.is_some() {
            self.heap
                .retain(|Reverse(entry)| entry.registration != registration);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// The host-side object a registration holds
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Timer { handle: ForeignRef, role: TimerRole },
    Host { deferred: ForeignRef },
}

/// One outstanding host registration
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub task: TaskId,
    pub callback: CallbackId,
    pub source: Source,
}

/// Outstanding host registrations, for cancellation lookups
#[derive(Debug, Default)]
pub struct Ledger {
    entries: BTreeMap<RegistrationId, Registration>,
    next: u64,
}

impl Ledger {
    /// Reserves an id before the host registration is made
    pub fn reserve(&mut self) -> RegistrationId {
        self.next += 1;
        RegistrationId(self.next)
    }

    pub fn insert(&mut self, id: RegistrationId, registration: Registration) {
        self.entries.insert(id, registration);
    }

    pub fn get(&self, id: RegistrationId) -> Option<&Registration> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: RegistrationId) -> Option<Registration> {
        self.entries.remove(&id)
    }

    /// Registrations owned by a task
    pub fn owned_by(&self, task: TaskId) -> Vec<RegistrationId> {
        self.entries
            .iter()
            .filter(|(_, registration)| registration.task == task)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
