//! User-level threads.
//!
//! A ULT is a cooperatively scheduled work unit with its own context. It
//! runs until it yields, blocks, or finishes; the dispatching stream's
//! scheduling loop regains control at each of those points. Wake-up of a
//! blocked ULT re-queues it into its pool, and the pool's blocked counter
//! keeps the unit visible to `total_size` while it is parked.

use crate::context::{context_switch, Context};
use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::sched::Scheduler;
use crate::unit::Unit;
use crate::xstream::Xstream;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Unique identifier for a ULT.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UltId(u64);

static NEXT_ULT_ID: AtomicU64 = AtomicU64::new(1);

impl UltId {
    fn new() -> Self {
        UltId(NEXT_ULT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// State of a ULT.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UltState {
    /// Queued in a pool, runnable
    Ready,
    /// Executing on a stream
    Running,
    /// Announced intent to block, not yet parked out
    Blocking,
    /// Parked; counted in its pool's blocked tally
    Blocked,
    /// Finished
    Terminated,
}

const READY: u8 = 0;
const RUNNING: u8 = 1;
const BLOCKING: u8 = 2;
const BLOCKED: u8 = 3;
const TERMINATED: u8 = 4;

impl UltState {
    fn from_u8(v: u8) -> Self {
        match v {
            READY => UltState::Ready,
            RUNNING => UltState::Running,
            BLOCKING => UltState::Blocking,
            BLOCKED => UltState::Blocked,
            _ => UltState::Terminated,
        }
    }
}

struct JoinState {
    done: bool,
    waiters: Vec<Arc<Ult>>,
}

/// A user-level thread.
pub struct Ult {
    id: UltId,
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    ctx: Arc<Context>,
    state: AtomicU8,
    pool: Mutex<Option<Arc<Pool>>>,
    host: Mutex<Option<Arc<Xstream>>>,
    return_to: Mutex<Option<Arc<Context>>>,
    carrier: Mutex<Option<JoinHandle<()>>>,
    join: Mutex<JoinState>,
    join_cv: Condvar,
}

impl Ult {
    /// Create a ULT and push it into `pool`.
    ///
    /// The calling thread must be attached to an execution stream; the
    /// pool's access mode decides whether that stream may push here.
    pub fn create<F>(pool: &Arc<Pool>, body: F) -> Result<Arc<Ult>>
    where
        F: FnOnce() + Send + 'static,
    {
        let xstream = Xstream::current().ok_or(Error::InvalidXstream)?;
        pool.set_producer(xstream.id())?;

        let ult = Arc::new(Ult {
            id: UltId::new(),
            body: Mutex::new(Some(Box::new(body))),
            ctx: Arc::new(Context::new()),
            state: AtomicU8::new(READY),
            pool: Mutex::new(Some(pool.clone())),
            host: Mutex::new(None),
            return_to: Mutex::new(None),
            carrier: Mutex::new(None),
            join: Mutex::new(JoinState {
                done: false,
                waiters: Vec::new(),
            }),
            join_cv: Condvar::new(),
        });
        pool.push(Unit::Ult(ult.clone()));
        Ok(ult)
    }

    /// Identifier of this ULT.
    pub fn id(&self) -> UltId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> UltState {
        UltState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run the ULT on the calling stream's scheduling context.
    ///
    /// Returns once the ULT yields, blocks, or finishes; the unit is
    /// re-queued or accounted for accordingly before this returns.
    pub(crate) fn dispatch(self: &Arc<Self>, xstream: &Arc<Xstream>) -> Result<()> {
        *self.host.lock() = Some(xstream.clone());
        *self.return_to.lock() = Some(xstream.sched_ctx().clone());
        self.ensure_carrier()?;
        self.state.store(RUNNING, Ordering::Release);
        context_switch(xstream.sched_ctx(), &self.ctx);

        // back on the scheduling context: settle what happens to the unit
        match self.state.load(Ordering::Acquire) {
            READY => self.requeue(),
            BLOCKING => {
                if self
                    .state
                    .compare_exchange(BLOCKING, BLOCKED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Some(pool) = self.pool.lock().clone() {
                        pool.inc_blocked();
                    }
                } else {
                    // a waker beat us to it; the unit is ready again
                    self.requeue();
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn requeue(self: &Arc<Self>) {
        if let Some(pool) = self.pool.lock().clone() {
            pool.push(Unit::Ult(self.clone()));
        }
    }

    fn ensure_carrier(self: &Arc<Self>) -> Result<()> {
        let mut carrier = self.carrier.lock();
        if carrier.is_some() {
            return Ok(());
        }
        let ult = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("weft-ult-{}", self.id.as_u64()))
            .spawn(move || carrier_main(ult))
            .map_err(|e| Error::Mem(e.to_string()))?;
        *carrier = Some(handle);
        Ok(())
    }

    fn install_tls(self: &Arc<Self>) {
        let host = self.host.lock().clone();
        crate::xstream::install_ult_tls(host, self.ctx.clone(), self.clone());
    }

    /// Give the processor back to the scheduling loop; the ULT is
    /// re-queued and resumes at some later dispatch.
    pub(crate) fn cooperative_yield(self: &Arc<Self>) {
        let Some(return_to) = self.return_to.lock().clone() else {
            return;
        };
        self.state.store(READY, Ordering::Release);
        context_switch(&self.ctx, &return_to);
        self.install_tls();
    }

    /// Park this ULT until [`Ult::wake`]. Must be called on the ULT's own
    /// context.
    pub(crate) fn suspend_cooperative(self: &Arc<Self>) {
        let Some(return_to) = self.return_to.lock().clone() else {
            return;
        };
        self.state.store(BLOCKING, Ordering::Release);
        context_switch(&self.ctx, &return_to);
        self.install_tls();
    }

    /// Make a parked ULT runnable again.
    pub(crate) fn wake(self: &Arc<Self>) {
        loop {
            match self.state.load(Ordering::Acquire) {
                BLOCKING => {
                    // not parked out yet; the dispatching stream requeues
                    if self
                        .state
                        .compare_exchange(BLOCKING, READY, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                BLOCKED => {
                    if self
                        .state
                        .compare_exchange(BLOCKED, READY, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        if let Some(pool) = self.pool.lock().clone() {
                            pool.dec_blocked();
                            pool.push(Unit::Ult(self.clone()));
                        }
                        return;
                    }
                }
                // the waiter registered but has not reached its park yet
                RUNNING => std::thread::yield_now(),
                _ => return,
            }
        }
    }

    /// Wait until this ULT has finished.
    ///
    /// From another ULT this parks cooperatively; a caller on a primary
    /// stream's main context keeps scheduling while it waits; external
    /// threads block on a condvar.
    pub fn join(self: &Arc<Self>) {
        if let Some(current) = crate::xstream::current_ult() {
            if Arc::ptr_eq(self, &current) {
                return;
            }
            {
                let mut join = self.join.lock();
                if join.done {
                    return;
                }
                join.waiters.push(current.clone());
            }
            current.suspend_cooperative();
            return;
        }

        loop {
            if self.join.lock().done {
                return;
            }
            if !crate::runtime::yield_now() {
                break;
            }
            std::thread::yield_now();
        }
        let mut join = self.join.lock();
        while !join.done {
            self.join_cv.wait(&mut join);
        }
    }

    /// Move this ULT into a pool of `sched`, subject to the target pool's
    /// access-mode matrix. Only queued (ready) units can migrate.
    pub fn migrate_to_sched(self: &Arc<Self>, sched: &Arc<Scheduler>) -> Result<()> {
        let source = self
            .pool
            .lock()
            .clone()
            .ok_or(Error::Sched("unit is not in a pool"))?;

        // the stream mutex orders this against a termination commit
        let xstream = sched.bound_xstream();
        let _top = xstream.as_ref().map(|xs| xs.top_sched_guard());

        let target = sched.migration_pool(&source)?;
        target.inc_migrating();
        let unit = Unit::Ult(self.clone());
        if !source.remove(&unit) {
            target.dec_migrating();
            return Err(Error::Sched("unit is not queued in its pool"));
        }
        *self.pool.lock() = Some(target.clone());
        target.push(unit);
        target.dec_migrating();
        trace!("ult {} migrated pool {:?} -> {:?}", self.id.as_u64(), source.id(), target.id());
        Ok(())
    }

    fn finish(self: &Arc<Self>) {
        self.state.store(TERMINATED, Ordering::Release);
        *self.host.lock() = None;
        let waiters = {
            let mut join = self.join.lock();
            join.done = true;
            std::mem::take(&mut join.waiters)
        };
        self.join_cv.notify_all();
        for waiter in waiters {
            waiter.wake();
        }
        crate::xstream::clear_tls();
        let return_to = self.return_to.lock().take();
        if let Some(return_to) = return_to {
            return_to.resume();
        }
    }
}

fn carrier_main(ult: Arc<Ult>) {
    // parked until the first dispatch
    ult.ctx.suspend();
    ult.install_tls();
    let body = ult.body.lock().take();
    if let Some(body) = body {
        body();
    }
    ult.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolAccess, PoolKind};

    #[test]
    fn test_create_requires_attached_thread() {
        let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false);
        let result = Ult::create(&pool, || {});
        assert!(matches!(result, Err(Error::InvalidXstream)));
        assert_eq!(pool.size(), 0);
    }
}
