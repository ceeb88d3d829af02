// Property-based tests for timer wakeup order
//
// 1. Sleepers finish in (deadline, spawn) order whatever order they were spawned in
// 2. Cancelling any subset leaves no host registration behind

use coop_scheduler::{ExitReason, Resume, Scheduler, Step, WaitOn};
use core_types::Duration;
use hal::BoardCatalog;
use host_bridge::{SharedBridge, SimController, SimHost};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

fn setup() -> (Scheduler, SimController) {
    let host = SimHost::new(BoardCatalog::generic_metro());
    let controller = host.controller();
    (Scheduler::new(SharedBridge::new(Box::new(host))), controller)
}

fn drain(scheduler: &mut Scheduler) {
    loop {
        scheduler.bridge().pump();
        let report = scheduler.step(usize::MAX).unwrap();
        if report.resumed == 0 && report.woken == 0 && scheduler.ready_len() == 0 {
            break;
        }
    }
}

proptest! {
    #[test]
    fn sleepers_finish_in_deadline_order(delays in prop::collection::vec(0u64..40, 1..12)) {
        let (mut scheduler, controller) = setup();
        let finished = Rc::new(RefCell::new(Vec::new()));
        for (index, delay) in delays.iter().copied().enumerate() {
            let finished = Rc::clone(&finished);
            scheduler
                .spawn_fn(&format!("sleeper-{index}"), move |_cx, resume| match resume.check()? {
                    Resume::Start => Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(delay)))),
                    _ => {
                        finished.borrow_mut().push(index);
                        Ok(Step::Done)
                    }
                })
                .unwrap();
        }
        drain(&mut scheduler);
        controller.advance(Duration::from_millis(40));
        drain(&mut scheduler);

        let mut expected: Vec<usize> = (0..delays.len()).collect();
        expected.sort_by_key(|&index| (delays[index], index));
        prop_assert_eq!(finished.borrow().clone(), expected);
        prop_assert!(scheduler.is_complete());
    }

    #[test]
    fn cancelled_sleepers_leave_no_registrations(cancel in prop::collection::vec(any::<bool>(), 1..10)) {
        let (mut scheduler, controller) = setup();
        let mut ids = Vec::new();
        for index in 0..cancel.len() {
            let id = scheduler
                .spawn_fn(&format!("sleeper-{index}"), |_cx, resume| match resume.check()? {
                    Resume::Start => Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(25)))),
                    _ => Ok(Step::Done),
                })
                .unwrap();
            ids.push(id);
        }
        drain(&mut scheduler);
        for (id, &cancel) in ids.iter().zip(&cancel) {
            if cancel {
                scheduler.cancel(*id).unwrap();
            }
        }
        drain(&mut scheduler);
        let remaining = cancel.iter().filter(|&&cancel| !cancel).count();
        prop_assert_eq!(controller.active_timers(), remaining);

        controller.advance(Duration::from_millis(25));
        drain(&mut scheduler);
        prop_assert_eq!(scheduler.pending_registrations(), 0);
        prop_assert_eq!(scheduler.bridge().stats().live_references, 1);
        for (id, &cancel) in ids.iter().zip(&cancel) {
            let expected = if cancel { ExitReason::Cancelled } else { ExitReason::Normal };
            prop_assert_eq!(scheduler.exit_reason(*id), Some(&expected));
        }
    }
}
