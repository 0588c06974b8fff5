//! Runtime bootstrap and the primary execution stream.
//!
//! `Runtime::init` turns the calling OS thread into the primary stream's
//! main context. Work pushed to the primary stream only runs while that
//! thread yields into the scheduler; secondary streams created with
//! [`Xstream::create`] run freely on their own pump threads.

use crate::config::SchedConfig;
use crate::context::context_switch;
use crate::error::Result;
use crate::sched::{SchedPredef, Scheduler};
use crate::xstream::{Xstream, XstreamState};
use dashmap::DashMap;
use log::trace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

struct Global {
    xstreams: DashMap<u32, Weak<Xstream>>,
}

static GLOBAL: OnceLock<Global> = OnceLock::new();

fn global() -> &'static Global {
    GLOBAL.get_or_init(|| Global {
        xstreams: DashMap::new(),
    })
}

pub(crate) fn register_xstream(xstream: &Arc<Xstream>) {
    let registry = &global().xstreams;
    registry.insert(xstream.rank(), Arc::downgrade(xstream));
    registry.retain(|_, weak| weak.strong_count() > 0);
}

/// Number of live execution streams in the process.
pub fn num_xstreams() -> usize {
    global()
        .xstreams
        .iter()
        .filter(|entry| entry.value().strong_count() > 0)
        .count()
}

/// Handle to an initialized runtime.
///
/// Dropping it finalizes: the primary scheduler is asked to finish and
/// the calling thread drives it until it drains. Finalization must
/// happen on the thread that called `init`.
pub struct Runtime {
    primary: Arc<Xstream>,
    finalized: AtomicBool,
}

impl Runtime {
    /// Initialize the runtime with a default primary scheduler (basic,
    /// one MPSC FIFO pool).
    pub fn init() -> Result<Runtime> {
        let sched =
            Scheduler::create_basic(SchedPredef::Default, 1, None, &SchedConfig::default())?;
        Runtime::init_with_sched(sched)
    }

    /// Initialize the runtime with a caller-provided primary scheduler.
    pub fn init_with_sched(sched: Arc<Scheduler>) -> Result<Runtime> {
        crate::logging::initialize();
        let primary = Xstream::start(sched, true)?;
        crate::xstream::install_main_tls(&primary);
        trace!("runtime initialized, primary xstream {}", primary.rank());
        Ok(Runtime {
            primary,
            finalized: AtomicBool::new(false),
        })
    }

    /// The primary execution stream.
    pub fn primary(&self) -> &Arc<Xstream> {
        &self.primary
    }

    /// Shut the runtime down: finish the primary scheduler, drain it,
    /// and join its pump thread.
    pub fn finalize(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sched) = self.primary.main_sched() {
            sched.finish();
        }
        // keep yielding into the scheduling context until the pump exits;
        // its final act is to resume us
        while self.primary.state() != XstreamState::Terminated {
            match self.primary.main_ctx() {
                Some(main_ctx) => context_switch(main_ctx, self.primary.sched_ctx()),
                None => break,
            }
        }
        self.primary.join();
        crate::xstream::clear_tls();
        trace!("runtime finalized");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Yield the calling context to its scheduler.
///
/// From a ULT this re-queues the caller and resumes at a later dispatch.
/// From a primary stream's main context this runs the scheduling loop
/// until it drains back. Returns false when the caller has nothing to
/// yield to.
pub fn yield_now() -> bool {
    if let Some(ult) = crate::xstream::current_ult() {
        ult.cooperative_yield();
        return true;
    }
    if let Some(xstream) = Xstream::current() {
        if xstream.state() == XstreamState::Terminated {
            return false;
        }
        if let (Some(main_ctx), Some(current)) =
            (xstream.main_ctx(), crate::xstream::current_ctx())
        {
            if Arc::ptr_eq(main_ctx, &current) {
                context_switch(main_ctx, xstream.sched_ctx());
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yield_now_off_stream_is_noop() {
        assert!(!yield_now());
    }

    #[test]
    fn test_init_and_finalize() {
        let runtime = Runtime::init().unwrap();
        assert!(runtime.primary().main_sched().is_some());
        assert!(num_xstreams() >= 1);
        runtime.finalize();
        // the thread is detached again
        assert!(Xstream::current().is_none());
    }

    #[test]
    fn test_finalize_via_drop() {
        let runtime = Runtime::init().unwrap();
        drop(runtime);
        assert!(Xstream::current().is_none());
    }
}
