//! Locks and events
//!
//! Plain bookkeeping; the scheduler decides when waiters run. Locks hand
//! ownership straight to the longest waiter on release, so a task that
//! just released cannot barge back in ahead of the queue.

use crate::error::SchedulerError;
use core_types::{EventId, LockId, TaskId};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<TaskId>,
    waiters: VecDeque<TaskId>,
}

#[derive(Debug, Default)]
struct EventState {
    set: bool,
    waiters: Vec<TaskId>,
}

/// All locks and events of one scheduler
#[derive(Debug, Default)]
pub struct SyncState {
    locks: BTreeMap<LockId, LockState>,
    events: BTreeMap<EventId, EventState>,
    next_lock: u32,
    next_event: u32,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_lock(&mut self) -> LockId {
        self.next_lock += 1;
        let id = LockId::from_raw(self.next_lock);
        self.locks.insert(id, LockState::default());
        id
    }

    pub fn create_event(&mut self) -> EventId {
        self.next_event += 1;
        let id = EventId::from_raw(self.next_event);
        self.events.insert(id, EventState::default());
        id
    }

    fn lock_mut(&mut self, lock: LockId) -> Result<&mut LockState, SchedulerError> {
        self.locks
            .get_mut(&lock)
            .ok_or(SchedulerError::UnknownLock(lock))
    }

    fn event_mut(&mut self, event: EventId) -> Result<&mut EventState, SchedulerError> {
        self.events
            .get_mut(&event)
            .ok_or(SchedulerError::UnknownEvent(event))
    }

    /// Current owner of a lock
    pub fn owner(&self, lock: LockId) -> Result<Option<TaskId>, SchedulerError> {
        self.locks
            .get(&lock)
            .map(|state| state.owner)
            .ok_or(SchedulerError::UnknownLock(lock))
    }

    /// Takes the lock if it is free
    ///
    /// Not reentrant: the owner asking again gets `false`.
    pub fn try_acquire(&mut self, lock: LockId, task: TaskId) -> Result<bool, SchedulerError> {
        let state = self.lock_mut(lock)?;
        if state.owner.is_some() {
            return Ok(false);
        }
        state.owner = Some(task);
        Ok(true)
    }

    /// Queues a task behind the current owner
    pub fn enqueue_waiter(&mut self, lock: LockId, task: TaskId) -> Result<(), SchedulerError> {
        self.lock_mut(lock)?.waiters.push_back(task);
        Ok(())
    }

    /// Releases a lock held by `task`
    ///
    /// Returns the waiter that now owns it, if any.
    pub fn release(&mut self, lock: LockId, task: TaskId) -> Result<Option<TaskId>, SchedulerError> {
        let state = self.lock_mut(lock)?;
        if state.owner != Some(task) {
            return Err(SchedulerError::NotLockOwner { lock, task });
        }
        state.owner = state.waiters.pop_front();
        Ok(state.owner)
    }

    /// Releases every lock `task` holds, returning the new owners
    pub fn release_all(&mut self, task: TaskId) -> Vec<(LockId, TaskId)> {
        let mut handoffs = Vec::new();
        for (id, state) in self.locks.iter_mut() {
            if state.owner == Some(task) {
                state.owner = state.waiters.pop_front();
                if let Some(next) = state.owner {
                    handoffs.push((*id, next));
                }
            }
        }
        handoffs
    }

    pub fn is_set(&self, event: EventId) -> Result<bool, SchedulerError> {
        self.events
            .get(&event)
            .map(|state| state.set)
            .ok_or(SchedulerError::UnknownEvent(event))
    }

    /// Sets the event and returns every waiter, in wait order
    pub fn set(&mut self, event: EventId) -> Result<Vec<TaskId>, SchedulerError> {
        let state = self.event_mut(event)?;
        state.set = true;
        Ok(std::mem::take(&mut state.waiters))
    }

    pub fn clear(&mut self, event: EventId) -> Result<(), SchedulerError> {
        self.event_mut(event)?.set = false;
        Ok(())
    }

    pub fn add_event_waiter(&mut self, event: EventId, task: TaskId) -> Result<(), SchedulerError> {
        self.event_mut(event)?.waiters.push(task);
        Ok(())
    }

    /// Drops `task` from every wait queue
    pub fn remove_waiter(&mut self, task: TaskId) {
        for state in self.locks.values_mut() {
            state.waiters.retain(|&waiter| waiter != task);
        }
        for state in self.events.values_mut() {
            state.waiters.retain(|&waiter| waiter != task);
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_handoff_is_fifo() {
        let mut sync = SyncState::new();
        let lock = sync.create_lock();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());

        assert!(sync.try_acquire(lock, a).unwrap());
        assert!(!sync.try_acquire(lock, b).unwrap());
        sync.enqueue_waiter(lock, b).unwrap();
        sync.enqueue_waiter(lock, c).unwrap();

        assert_eq!(sync.release(lock, a).unwrap(), Some(b));
        assert_eq!(sync.owner(lock).unwrap(), Some(b));
        assert_eq!(sync.release(lock, b).unwrap(), Some(c));
        assert_eq!(sync.release(lock, c).unwrap(), None);
    }

    #[test]
    fn test_release_by_non_owner() {
        let mut sync = SyncState::new();
        let lock = sync.create_lock();
        let (a, b) = (TaskId::new(), TaskId::new());
        sync.try_acquire(lock, a).unwrap();
        assert_eq!(
            sync.release(lock, b),
            Err(SchedulerError::NotLockOwner { lock, task: b })
        );
    }

    #[test]
    fn test_not_reentrant() {
        let mut sync = SyncState::new();
        let lock = sync.create_lock();
        let a = TaskId::new();
        assert!(sync.try_acquire(lock, a).unwrap());
        assert!(!sync.try_acquire(lock, a).unwrap());
    }

    #[test]
    fn test_release_all_skips_removed_waiters() {
        let mut sync = SyncState::new();
        let first = sync.create_lock();
        let second = sync.create_lock();
        let (a, b, c) = (TaskId::new(), TaskId::new(), TaskId::new());
        sync.try_acquire(first, a).unwrap();
        sync.try_acquire(second, a).unwrap();
        sync.enqueue_waiter(first, b).unwrap();
        sync.enqueue_waiter(second, c).unwrap();
        sync.remove_waiter(c);

        assert_eq!(sync.release_all(a), vec![(first, b)]);
        assert_eq!(sync.owner(second).unwrap(), None);
    }

    #[test]
    fn test_event_set_returns_waiters() {
        let mut sync = SyncState::new();
        let event = sync.create_event();
        let (a, b) = (TaskId::new(), TaskId::new());
        sync.add_event_waiter(event, a).unwrap();
        sync.add_event_waiter(event, b).unwrap();

        assert_eq!(sync.set(event).unwrap(), vec![a, b]);
        assert!(sync.is_set(event).unwrap());
        assert!(sync.set(event).unwrap().is_empty());
        sync.clear(event).unwrap();
        assert!(!sync.is_set(event).unwrap());
    }

    #[test]
    fn test_unknown_ids() {
        let mut sync = SyncState::new();
        let lock = LockId::from_raw(9);
        let event = EventId::from_raw(9);
        assert_eq!(
            sync.try_acquire(lock, TaskId::new()),
            Err(SchedulerError::UnknownLock(lock))
        );
        assert_eq!(sync.set(event), Err(SchedulerError::UnknownEvent(event)));
    }
}
