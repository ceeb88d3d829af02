//! Scheduling contract tests
//!
//! Scripts run through the supervisor produce the same hardware trace and
//! the same timing under every provider.

use crate::test_helpers::*;
use coop_scheduler::{Resume, Step, TaskError, WaitOn};
use core_types::{Duration, Instant};
use hal::DigitalInOut;
use std::cell::RefCell;
use std::rc::Rc;
use supervisor::scripts::sleep_then_count;
use supervisor::{Blink, Runtime, Tally};

/// What a scheduled scenario left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTrace {
    pub writes: Vec<bool>,
    pub tally: Tally,
    pub finished_at: Instant,
    pub failures: Vec<String>,
}

/// A blinking LED next to two counting sleepers
pub fn blink_and_count(runtime: &mut Runtime) -> RunTrace {
    let hal = runtime.hal().clone();
    let tally = Rc::new(RefCell::new(Tally::default()));
    let supervisor = runtime.supervisor_mut();
    supervisor
        .spawn("blink", Blink::toggles(&hal, "LED", 3, Duration::from_millis(15)))
        .expect("spawn failed");
    supervisor
        .spawn_fn("slow", sleep_then_count("slow", Duration::from_millis(20), Rc::clone(&tally)))
        .expect("spawn failed");
    supervisor
        .spawn_fn("fast", sleep_then_count("fast", Duration::from_millis(10), Rc::clone(&tally)))
        .expect("spawn failed");

    let summary = runtime.run().expect("run failed");
    let pin = board_pin(runtime, "LED");
    let writes = runtime.peripherals().borrow().write_history(&pin);
    let tally = tally.borrow().clone();
    RunTrace {
        writes,
        tally,
        finished_at: runtime.controller().now(),
        failures: summary.failures.into_iter().map(|f| f.message).collect(),
    }
}

/// Two tasks contend for the LED; the loser fails with the claim error
pub fn claim_contention(runtime: &mut Runtime) -> RunTrace {
    let hal = runtime.hal().clone();
    let holder_hal = hal.clone();
    let mut held: Option<DigitalInOut> = None;
    let supervisor = runtime.supervisor_mut();
    supervisor
        .spawn_fn("holder", move |_cx, resume| match resume.check()? {
            Resume::Start => {
                held = Some(DigitalInOut::new(&holder_hal, "LED").map_err(TaskError::failed)?);
                Ok(Step::Wait(WaitOn::Sleep(Duration::from_millis(5))))
            }
            _ => {
                drop(held.take());
                Ok(Step::Done)
            }
        })
        .expect("spawn failed");
    supervisor
        .spawn_fn("intruder", move |_cx, resume| {
            resume.check()?;
            DigitalInOut::new(&hal, "D13").map_err(TaskError::failed)?;
            Ok(Step::Done)
        })
        .expect("spawn failed");

    let summary = runtime.run().expect("run failed");
    RunTrace {
        writes: Vec::new(),
        tally: Tally::default(),
        finished_at: runtime.controller().now(),
        failures: summary.failures.into_iter().map(|f| f.message).collect(),
    }
}

// ===== Contract Tests =====
