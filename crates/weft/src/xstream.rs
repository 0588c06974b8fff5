//! Execution streams.
//!
//! An execution stream (xstream) is an OS thread hosting a stack of
//! schedulers. The bottom entry is the stream's main scheduler; popping a
//! [`Unit::Sched`] stacks the child on top and drives its loop until it
//! stops. Streams carry a request word of their own: `join` raises a
//! request that scheduling loops forward to whatever scheduler is
//! currently running, which is what lets a joined stream drain stacked
//! schedulers before its pump thread exits.

use crate::config::SchedConfig;
use crate::context::{context_switch, Context};
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolReader};
use crate::sched::{SchedPredef, SchedType, SchedUsed, Scheduler};
use crate::task::Task;
use crate::ult::Ult;
use crate::unit::Unit;
use log::{trace, warn};
use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Ask the stream to stop once its schedulers drain.
const XS_REQ_JOIN: u32 = 1 << 0;
/// Ask the stream to stop immediately.
const XS_REQ_EXIT: u32 = 1 << 1;

/// Unique identifier for an execution stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct XstreamId(u32);

static NEXT_XSTREAM_ID: AtomicU32 = AtomicU32::new(0);

impl XstreamId {
    fn new() -> Self {
        XstreamId(NEXT_XSTREAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric ID value (the stream's rank).
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(n: u32) -> Self {
        XstreamId(1_000_000 + n)
    }
}

/// State of an execution stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum XstreamState {
    /// Created; the pump has not entered its loop yet
    Created,
    /// The pump is driving schedulers
    Running,
    /// The pump has exited
    Terminated,
}

impl XstreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => XstreamState::Created,
            1 => XstreamState::Running,
            _ => XstreamState::Terminated,
        }
    }
}

thread_local! {
    static CURRENT_XSTREAM: RefCell<Option<Arc<Xstream>>> = RefCell::new(None);
    static CURRENT_CTX: RefCell<Option<Arc<Context>>> = RefCell::new(None);
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = RefCell::new(None);
    static CURRENT_ULT: RefCell<Option<Arc<Ult>>> = RefCell::new(None);
}

pub(crate) fn current_ult() -> Option<Arc<Ult>> {
    CURRENT_ULT.with(|c| c.borrow().clone())
}

pub(crate) fn current_task() -> Option<Arc<Task>> {
    CURRENT_TASK.with(|c| c.borrow().clone())
}

pub(crate) fn current_ctx() -> Option<Arc<Context>> {
    CURRENT_CTX.with(|c| c.borrow().clone())
}

fn set_current_task(task: Option<Arc<Task>>) {
    CURRENT_TASK.with(|c| *c.borrow_mut() = task);
}

/// Attach a ULT carrier thread: called on every resume, because a
/// migrated ULT may wake up on a different stream.
pub(crate) fn install_ult_tls(host: Option<Arc<Xstream>>, ctx: Arc<Context>, ult: Arc<Ult>) {
    CURRENT_XSTREAM.with(|c| *c.borrow_mut() = host);
    CURRENT_CTX.with(|c| *c.borrow_mut() = Some(ctx));
    CURRENT_ULT.with(|c| *c.borrow_mut() = Some(ult));
}

/// Attach the calling thread as a stream's main context.
pub(crate) fn install_main_tls(xstream: &Arc<Xstream>) {
    CURRENT_XSTREAM.with(|c| *c.borrow_mut() = Some(xstream.clone()));
    CURRENT_CTX.with(|c| *c.borrow_mut() = xstream.main_ctx.clone());
}

fn install_pump_tls(xstream: &Arc<Xstream>) {
    CURRENT_XSTREAM.with(|c| *c.borrow_mut() = Some(xstream.clone()));
    CURRENT_CTX.with(|c| *c.borrow_mut() = Some(xstream.sched_ctx.clone()));
}

pub(crate) fn clear_tls() {
    CURRENT_XSTREAM.with(|c| *c.borrow_mut() = None);
    CURRENT_CTX.with(|c| *c.borrow_mut() = None);
    CURRENT_TASK.with(|c| *c.borrow_mut() = None);
    CURRENT_ULT.with(|c| *c.borrow_mut() = None);
}

/// True when the caller is a stream's scheduling context itself, with no
/// task or ULT in flight.
pub(crate) fn on_sched_context(xstream: &Arc<Xstream>) -> bool {
    if current_task().is_some() || current_ult().is_some() {
        return false;
    }
    match current_ctx() {
        Some(ctx) => Arc::ptr_eq(&ctx, &xstream.sched_ctx),
        None => false,
    }
}

/// An OS-level worker hosting a stack of schedulers.
pub struct Xstream {
    id: XstreamId,
    scheds: Mutex<Vec<Arc<Scheduler>>>,
    top_sched_mutex: Mutex<()>,
    request: AtomicU32,
    sched_ctx: Arc<Context>,
    main_ctx: Option<Arc<Context>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    state: AtomicU8,
}

impl Xstream {
    /// Create a stream driven by `sched`, or by a default basic
    /// scheduler with one MPSC FIFO pool when `None`.
    pub fn create(sched: Option<Arc<Scheduler>>) -> Result<Arc<Xstream>> {
        let sched = match sched {
            Some(sched) => sched,
            None => Scheduler::create_basic(SchedPredef::Basic, 1, None, &SchedConfig::default())?,
        };
        Xstream::start(sched, false)
    }

    /// Create a stream driven by a predefined scheduler.
    pub fn create_basic(
        predef: SchedPredef,
        num_pools: usize,
        pools: Option<Vec<Arc<Pool>>>,
        config: &SchedConfig,
    ) -> Result<Arc<Xstream>> {
        let sched = Scheduler::create_basic(predef, num_pools, pools, config)?;
        Xstream::start(sched, false)
    }

    pub(crate) fn start(sched: Arc<Scheduler>, primary: bool) -> Result<Arc<Xstream>> {
        let xstream = Arc::new(Xstream {
            id: XstreamId::new(),
            scheds: Mutex::new(Vec::new()),
            top_sched_mutex: Mutex::new(()),
            request: AtomicU32::new(0),
            sched_ctx: Arc::new(Context::new()),
            main_ctx: primary.then(|| Arc::new(Context::new())),
            pump: Mutex::new(None),
            state: AtomicU8::new(XstreamState::Created as u8),
        });
        xstream.attach_main_sched(sched)?;

        let pump_xstream = xstream.clone();
        let handle = std::thread::Builder::new()
            .name(format!("weft-xstream-{}", xstream.id.as_u32()))
            .spawn(move || pump_main(pump_xstream))
            .map_err(|e| Error::Mem(e.to_string()))?;
        *xstream.pump.lock() = Some(handle);
        crate::runtime::register_xstream(&xstream);
        Ok(xstream)
    }

    /// Becoming this stream's main scheduler makes the stream a reader
    /// of every pool the scheduler binds.
    fn attach_main_sched(self: &Arc<Self>, sched: Arc<Scheduler>) -> Result<()> {
        sched.associate(SchedUsed::Main)?;
        for pool in sched.pool_list() {
            if let Err(e) = pool.set_consumer(PoolReader::Stream(self.id)) {
                sched.deassociate();
                return Err(e);
            }
        }
        self.scheds.lock().push(sched);
        Ok(())
    }

    /// The stream the calling OS thread is attached to, if any.
    pub fn current() -> Option<Arc<Xstream>> {
        CURRENT_XSTREAM.with(|c| c.borrow().clone())
    }

    /// Identifier of this stream.
    pub fn id(&self) -> XstreamId {
        self.id
    }

    /// Rank (numeric id) of this stream.
    pub fn rank(&self) -> u32 {
        self.id.as_u32()
    }

    /// Current state.
    pub fn state(&self) -> XstreamState {
        XstreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The stream's main (bottom) scheduler.
    pub fn main_sched(&self) -> Option<Arc<Scheduler>> {
        self.scheds.lock().first().cloned()
    }

    /// The scheduler currently on top of the stack.
    pub fn top_sched(&self) -> Option<Arc<Scheduler>> {
        self.scheds.lock().last().cloned()
    }

    /// Copy out the first `max_pools` pools of the main scheduler.
    pub fn main_pools(&self, max_pools: usize) -> Result<Vec<Arc<Pool>>> {
        let sched = self.main_sched().ok_or(Error::InvalidXstream)?;
        sched.pools(max_pools, 0)
    }

    /// Forward pending stream-level requests to the scheduler currently
    /// running. Scheduling loops call this between work units.
    pub fn check_events(&self, sched: &Arc<Scheduler>) {
        let request = self.request.load(Ordering::Acquire);
        if request & XS_REQ_JOIN != 0 {
            sched.finish();
        }
        if request & XS_REQ_EXIT != 0 {
            sched.exit();
        }
    }

    /// Ask the stream to drain and stop, then wait for its pump thread.
    ///
    /// Must not be called from the stream itself. The primary stream is
    /// shut down through the runtime instead.
    pub fn join(&self) {
        self.request.fetch_or(XS_REQ_JOIN, Ordering::Release);
        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Ask the stream to stop without draining, then wait for its pump
    /// thread. Units left in its pools are the caller's responsibility.
    pub fn cancel(&self) {
        self.request.fetch_or(XS_REQ_EXIT, Ordering::Release);
        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Execute one unit on this stream.
    ///
    /// Tasklets run inline; ULTs get the processor until they yield,
    /// block, or finish; a scheduler unit is stacked and driven until it
    /// stops, then freed if it owns itself.
    pub fn dispatch(self: &Arc<Self>, unit: Unit, current_sched: &Arc<Scheduler>) {
        match unit {
            Unit::Task(task) => {
                set_current_task(Some(task.clone()));
                task.execute();
                set_current_task(None);
            }
            Unit::Ult(ult) => {
                if current_sched.sched_type() == SchedType::Task {
                    // the type tag is only enforced here, at dispatch
                    warn!(
                        "task-only scheduler dispatched ult {}",
                        ult.id().as_u64()
                    );
                }
                if let Err(e) = ult.dispatch(self) {
                    warn!("ult {} dispatch failed: {}", ult.id().as_u64(), e);
                }
            }
            Unit::Sched(child) => {
                {
                    let _top = self.top_sched_mutex.lock();
                    self.scheds.lock().push(child.clone());
                }
                child.start_running(self);
                trace!("stacked scheduler running on xstream {}", self.rank());
                child.run_hook();
                {
                    let _top = self.top_sched_mutex.lock();
                    self.scheds.lock().pop();
                }
                if child.is_automatic() {
                    if let Err(e) = child.free() {
                        warn!("automatic scheduler free failed: {}", e);
                    }
                }
            }
        }
    }

    pub(crate) fn top_sched_guard(&self) -> MutexGuard<'_, ()> {
        self.top_sched_mutex.lock()
    }

    pub(crate) fn sched_ctx(&self) -> &Arc<Context> {
        &self.sched_ctx
    }

    pub(crate) fn has_main_ctx(&self) -> bool {
        self.main_ctx.is_some()
    }

    pub(crate) fn main_ctx(&self) -> Option<&Arc<Context>> {
        self.main_ctx.as_ref()
    }

    /// Hand the processor from the scheduling context back to the main
    /// context. Returns when the main context yields in again.
    pub(crate) fn yield_to_main(&self) {
        if let Some(main_ctx) = &self.main_ctx {
            context_switch(&self.sched_ctx, main_ctx);
        }
    }
}

impl fmt::Debug for Xstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xstream")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("primary", &self.main_ctx.is_some())
            .finish()
    }
}

fn pump_main(xstream: Arc<Xstream>) {
    install_pump_tls(&xstream);
    if xstream.main_ctx.is_some() {
        // primary: parked until the main context yields in
        xstream.sched_ctx.suspend();
    }
    xstream
        .state
        .store(XstreamState::Running as u8, Ordering::Release);

    if let Some(sched) = xstream.main_sched() {
        sched.start_running(&xstream);
        trace!("xstream {} running", xstream.rank());
        sched.run_hook();

        xstream.scheds.lock().clear();
        if sched.is_automatic() {
            if let Err(e) = sched.free() {
                warn!("main scheduler free failed: {}", e);
            }
        }
    }

    xstream
        .state
        .store(XstreamState::Terminated as u8, Ordering::Release);
    trace!("xstream {} terminated", xstream.rank());
    clear_tls();
    if let Some(main_ctx) = &xstream.main_ctx {
        main_ctx.resume();
    }
}
