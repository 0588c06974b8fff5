//! Round-robin FIFO scheduling policy.

use crate::config::{SchedConfig, DEFAULT_EVENT_FREQ};
use crate::error::Result;
use crate::sched::{SchedDef, Scheduler};
use crate::xstream::Xstream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The built-in basic policy: sweep all pools in order, run whatever
/// pops, and check for events every `event_freq` units.
#[derive(Debug, Default)]
pub struct BasicSched;

struct BasicData {
    event_freq: u32,
}

impl SchedDef for BasicSched {
    fn init(&self, sched: &Arc<Scheduler>, config: &SchedConfig) -> Result<()> {
        sched.set_data(Box::new(BasicData {
            event_freq: config.event_freq(),
        }));
        Ok(())
    }

    fn run(&self, sched: &Arc<Scheduler>) {
        let event_freq = sched
            .with_data(|d: &mut BasicData| d.event_freq)
            .unwrap_or(DEFAULT_EVENT_FREQ);
        let Some(xstream) = Xstream::current() else {
            return;
        };

        let mut work_count = 0u32;
        loop {
            let mut ran = false;
            for pool in sched.pool_list() {
                if let Some(unit) = pool.pop() {
                    xstream.dispatch(unit, sched);
                    ran = true;
                    work_count += 1;
                }
            }

            if !ran || work_count >= event_freq {
                work_count = 0;
                xstream.check_events(sched);
                match sched.has_to_stop() {
                    Ok(false) => {}
                    Ok(true) | Err(_) => break,
                }
                if !ran {
                    // idle; do not spin the carrier
                    thread::sleep(Duration::from_micros(50));
                }
            }
        }
    }

    fn free(&self, sched: &Arc<Scheduler>) {
        sched.take_data();
    }
}
