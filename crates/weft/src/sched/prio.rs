//! Multi-level priority scheduling policy.
//!
//! Pool 0 is the highest priority level. Each iteration drains from the
//! highest non-empty level, so lower levels only run while everything
//! above them is empty.

use crate::config::{SchedConfig, DEFAULT_EVENT_FREQ};
use crate::error::Result;
use crate::sched::{SchedDef, Scheduler};
use crate::xstream::Xstream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Number of priority levels the predef builds by default.
pub const PRIO_LEVELS: usize = 4;

/// The built-in priority policy.
#[derive(Debug, Default)]
pub struct PrioSched;

struct PrioData {
    event_freq: u32,
}

impl SchedDef for PrioSched {
    fn init(&self, sched: &Arc<Scheduler>, config: &SchedConfig) -> Result<()> {
        sched.set_data(Box::new(PrioData {
            event_freq: config.event_freq(),
        }));
        Ok(())
    }

    fn run(&self, sched: &Arc<Scheduler>) {
        let event_freq = sched
            .with_data(|d: &mut PrioData| d.event_freq)
            .unwrap_or(DEFAULT_EVENT_FREQ);
        let Some(xstream) = Xstream::current() else {
            return;
        };

        let mut work_count = 0u32;
        loop {
            // highest non-empty level wins
            if let Some(unit) = sched.pool_list().iter().find_map(|pool| pool.pop()) {
                xstream.dispatch(unit, sched);
                work_count += 1;
                if work_count < event_freq {
                    continue;
                }
            }

            work_count = 0;
            xstream.check_events(sched);
            match sched.has_to_stop() {
                Ok(false) => {}
                Ok(true) | Err(_) => break,
            }
            if sched.size() == 0 {
                thread::sleep(Duration::from_micros(50));
            }
        }
    }

    fn free(&self, sched: &Arc<Scheduler>) {
        sched.take_data();
    }
}
