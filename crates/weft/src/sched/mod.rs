//! Schedulers: pluggable policies bound to pools, driven by streams.
//!
//! A scheduler couples a policy (the [`SchedDef`] vtable) with an array
//! of pools and a small amount of lifecycle state. Execution streams
//! drive the policy's `run` hook; external threads steer it through the
//! finish/exit request word, which the loop observes at cooperative
//! checkpoints via [`Scheduler::has_to_stop`].

mod basic;
mod prio;

pub use basic::BasicSched;
pub use prio::{PrioSched, PRIO_LEVELS};

use crate::config::SchedConfig;
use crate::error::{Error, Result};
use crate::pool::{Pool, PoolAccess, PoolKind};
use crate::xstream::Xstream;
use log::trace;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Stop when every bound pool has drained.
pub(crate) const REQ_FINISH: u32 = 1 << 0;
/// Stop at the next checkpoint regardless of pool contents.
pub(crate) const REQ_EXIT: u32 = 1 << 1;

/// Lifecycle state of a scheduler. Transitions are monotonic:
/// READY → RUNNING → STOPPING → TERMINATED, never backwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SchedState {
    /// Constructed, not yet driven by a stream
    Ready,
    /// A stream is executing the run hook
    Running,
    /// A stop request was observed but its preconditions do not hold yet
    Stopping,
    /// Stopped; request bits are ignored from here on
    Terminated,
}

impl SchedState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SchedState::Ready,
            1 => SchedState::Running,
            2 => SchedState::Stopping,
            _ => SchedState::Terminated,
        }
    }
}

/// How a scheduler is attached.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedUsed {
    /// Not attached anywhere
    NotUsed,
    /// Top scheduler of an execution stream
    Main,
    /// Bound into another scheduler's pool as a work unit
    InPool,
}

/// Which unit kinds a policy can drive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedType {
    /// ULTs and tasklets
    Ult,
    /// Tasklets only
    Task,
}

/// Built-in scheduling policies.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedPredef {
    /// Alias for [`SchedPredef::Basic`]
    Default,
    /// Round-robin FIFO over all pools
    Basic,
    /// Multi-level priority over [`PRIO_LEVELS`] pools
    Prio,
}

impl FromStr for SchedPredef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(SchedPredef::Default),
            "basic" => Ok(SchedPredef::Basic),
            "prio" => Ok(SchedPredef::Prio),
            _ => Err(Error::InvalidSchedPredef),
        }
    }
}

/// Stable identity of a scheduler definition.
///
/// Derived from the definition's type, so "is this the built-in basic
/// policy?" is a plain equality check.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SchedKind(TypeId);

impl SchedKind {
    /// Kind of the definition type `D`.
    pub fn of<D: SchedDef>() -> SchedKind {
        SchedKind(TypeId::of::<D>())
    }
}

/// A scheduling policy definition.
///
/// Implementations are immutable; per-instance state lives in the
/// scheduler's data slot, installed by `init` and consumed by `run`.
pub trait SchedDef: Send + Sync + 'static {
    /// Which unit kinds this policy can drive.
    fn sched_type(&self) -> SchedType {
        SchedType::Ult
    }

    /// One-time setup. Runs after the instance is fully populated, so it
    /// may inspect pools and call [`Scheduler::set_data`].
    fn init(&self, _sched: &Arc<Scheduler>, _config: &SchedConfig) -> Result<()> {
        Ok(())
    }

    /// The scheduling loop: pick a pool, pop a unit, dispatch it, and
    /// periodically consult [`Scheduler::has_to_stop`]. Returns once that
    /// reports true.
    fn run(&self, sched: &Arc<Scheduler>);

    /// Release policy state installed by `init`. Called by
    /// [`Scheduler::free`] before the instance is torn down.
    fn free(&self, _sched: &Arc<Scheduler>) {}

    /// Pool that receives migrating units; `None` selects the first pool.
    fn migration_pool(&self, _sched: &Arc<Scheduler>) -> Option<Arc<Pool>> {
        None
    }
}

/// A scheduler instance.
pub struct Scheduler {
    def: Box<dyn SchedDef>,
    kind: SchedKind,
    sched_type: SchedType,
    pools: Vec<Arc<Pool>>,
    state: AtomicU8,
    request: AtomicU32,
    used: Mutex<SchedUsed>,
    automatic: AtomicBool,
    xstream: Mutex<Weak<Xstream>>,
    data: Mutex<Option<Box<dyn Any + Send>>>,
    freed: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler from a user-defined policy.
    ///
    /// The pool list is copied; `None` slots become default pools (FIFO,
    /// MPSC access, automatic). Every pool is retained. The definition's
    /// `init` hook runs last; if it fails, the retains are rolled back
    /// and the error is returned.
    pub fn create<D: SchedDef>(
        def: D,
        pools: Vec<Option<Arc<Pool>>>,
        config: &SchedConfig,
    ) -> Result<Arc<Scheduler>> {
        let kind = SchedKind::of::<D>();
        let sched_type = def.sched_type();

        let mut bound = Vec::with_capacity(pools.len());
        for slot in pools {
            bound.push(match slot {
                Some(pool) => pool,
                None => Pool::create_basic(PoolKind::Fifo, PoolAccess::default(), true),
            });
        }
        for pool in &bound {
            pool.retain();
        }

        let sched = Arc::new(Scheduler {
            def: Box::new(def),
            kind,
            sched_type,
            pools: bound,
            state: AtomicU8::new(SchedState::Ready as u8),
            request: AtomicU32::new(0),
            used: Mutex::new(SchedUsed::NotUsed),
            automatic: AtomicBool::new(false),
            xstream: Mutex::new(Weak::new()),
            data: Mutex::new(None),
            freed: AtomicBool::new(false),
        });

        if let Err(e) = sched.def.init(&sched, config) {
            // roll back the retains taken above; automatic defaults die
            // with the instance
            for pool in &sched.pools {
                pool.release();
            }
            return Err(e);
        }
        Ok(sched)
    }

    /// Create a scheduler from a predefined policy.
    ///
    /// Without a pool list, the predef's default topology is built: one
    /// pool for BASIC/DEFAULT, [`PRIO_LEVELS`] pools for PRIO, all FIFO
    /// with the configured access mode and automatic. The instance's
    /// automatic flag is read from `config`.
    pub fn create_basic(
        predef: SchedPredef,
        num_pools: usize,
        pools: Option<Vec<Arc<Pool>>>,
        config: &SchedConfig,
    ) -> Result<Arc<Scheduler>> {
        let slots: Vec<Option<Arc<Pool>>> = match pools {
            Some(list) => {
                if list.len() != num_pools {
                    return Err(Error::Sched("pool count mismatch"));
                }
                list.into_iter().map(Some).collect()
            }
            None => {
                let count = match predef {
                    SchedPredef::Default | SchedPredef::Basic => 1,
                    SchedPredef::Prio => PRIO_LEVELS,
                };
                (0..count)
                    .map(|_| {
                        Some(Pool::create_basic(
                            PoolKind::Fifo,
                            config.access(),
                            true,
                        ))
                    })
                    .collect()
            }
        };

        let sched = match predef {
            SchedPredef::Default | SchedPredef::Basic => {
                Scheduler::create(BasicSched::default(), slots, config)?
            }
            SchedPredef::Prio => Scheduler::create(PrioSched::default(), slots, config)?,
        };
        sched.automatic.store(config.automatic(), Ordering::Release);
        Ok(sched)
    }

    /// Release the scheduler.
    ///
    /// Every bound pool is released; an automatic pool whose last binder
    /// this was is destroyed with it. The definition's `free` hook runs
    /// before the data slot is cleared. Freeing twice fails with
    /// [`Error::InvalidSched`].
    pub fn free(self: &Arc<Self>) -> Result<()> {
        if self.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidSched);
        }
        for pool in &self.pools {
            let remaining = pool.release();
            if pool.is_automatic() && remaining == 0 {
                trace!("automatic pool {:?} dies with its last scheduler", pool.id());
                pool.discard();
            }
        }
        self.def.free(self);
        *self.data.lock() = None;
        Ok(())
    }

    /// Definition identity.
    pub fn kind(&self) -> SchedKind {
        self.kind
    }

    /// Which unit kinds this scheduler drives.
    pub fn sched_type(&self) -> SchedType {
        self.sched_type
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedState {
        SchedState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// How the scheduler is attached.
    pub fn used(&self) -> SchedUsed {
        *self.used.lock()
    }

    /// True when the scheduler frees itself after running as a work unit.
    pub fn is_automatic(&self) -> bool {
        self.automatic.load(Ordering::Acquire)
    }

    /// Number of bound pools.
    pub fn num_pools(&self) -> usize {
        self.pools.len()
    }

    /// Copy out `max_pools` pool handles starting at `idx`.
    pub fn pools(&self, max_pools: usize, idx: usize) -> Result<Vec<Arc<Pool>>> {
        if idx + max_pools > self.pools.len() {
            return Err(Error::Sched("pool range out of bounds"));
        }
        Ok(self.pools[idx..idx + max_pools].to_vec())
    }

    pub(crate) fn pool_list(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    /// Sum of pool sizes, excluding blocked and migrating units.
    pub fn size(&self) -> usize {
        self.pools.iter().map(|p| p.size()).sum()
    }

    /// Sum of pool sizes, including blocked and migrating units.
    pub fn total_size(&self) -> usize {
        self.pools.iter().map(|p| p.total_size()).sum()
    }

    /// Ask the scheduler to stop once every bound pool has drained.
    pub fn finish(&self) {
        self.request.fetch_or(REQ_FINISH, Ordering::Release);
    }

    /// Ask the scheduler to stop at its next checkpoint, leaving any
    /// remaining units in the pools. Draining them is the caller's
    /// responsibility.
    pub fn exit(&self) {
        self.request.fetch_or(REQ_EXIT, Ordering::Release);
    }

    pub(crate) fn request_word(&self) -> u32 {
        self.request.load(Ordering::Acquire)
    }

    /// Cooperative stop check, called from scheduling loops.
    ///
    /// Returns `Ok(true)` once the scheduler has committed to
    /// termination: immediately on an exit request, or on a finish
    /// request once `total_size` reaches zero (re-checked under the
    /// stream's top-scheduler mutex so a racing push cannot strand
    /// work). On the primary stream, a drained scheduler with no pending
    /// request hands control back to the main context and reports
    /// `Ok(false)` on resumption.
    ///
    /// Fails with [`Error::InvalidXstream`] when the calling OS thread is
    /// not attached to an execution stream.
    pub fn has_to_stop(self: &Arc<Self>) -> Result<bool> {
        let Some(xstream) = Xstream::current() else {
            return Err(Error::InvalidXstream);
        };
        let request = self.request_word();

        if request & REQ_EXIT != 0 {
            let _top = xstream.top_sched_guard();
            self.advance_state(SchedState::Terminated);
            trace!("sched terminated on exit request");
            return Ok(true);
        }

        if self.total_size() == 0 {
            if request & REQ_FINISH != 0 {
                // double-check under the lock: a migration landing
                // between the probe above and this commit must not be
                // stranded
                let _top = xstream.top_sched_guard();
                if self.total_size() == 0 {
                    self.advance_state(SchedState::Terminated);
                    trace!("sched terminated on finish request");
                    return Ok(true);
                }
                return Ok(false);
            }
            // drained with no request: the primary stream's scheduling
            // context yields back to the main context
            if xstream.has_main_ctx() && crate::xstream::on_sched_context(&xstream) {
                xstream.yield_to_main();
            }
        } else if request & REQ_FINISH != 0 {
            self.advance_state(SchedState::Stopping);
        }

        Ok(false)
    }

    /// Install opaque per-instance state. Intended for use by the
    /// definition's own hooks; access is not synchronized beyond the
    /// slot's lock.
    pub fn set_data(&self, data: Box<dyn Any + Send>) {
        *self.data.lock() = Some(data);
    }

    /// Borrow the data slot as `T`, if it holds one.
    pub fn with_data<T: Any + Send, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.data.lock();
        guard.as_mut().and_then(|d| d.downcast_mut::<T>()).map(f)
    }

    /// Remove and return the data slot.
    pub fn take_data(&self) -> Option<Box<dyn Any + Send>> {
        self.data.lock().take()
    }

    /// Pick the pool that receives a unit migrating out of `source`.
    ///
    /// Asks the definition first, falls back to the first pool, and
    /// validates the candidate against the access-mode matrix.
    pub fn migration_pool(self: &Arc<Self>, source: &Arc<Pool>) -> Result<Arc<Pool>> {
        if self.state() == SchedState::Terminated {
            return Err(Error::InvalidSched);
        }
        let candidate = match self.def.migration_pool(self) {
            Some(pool) => pool,
            None => match self.pools.first() {
                Some(pool) => pool.clone(),
                None => return Err(Error::InvalidSched),
            },
        };
        if candidate.accept_migration(source) {
            Ok(candidate)
        } else {
            Err(Error::InvalidPoolAccess)
        }
    }

    /// Mark the scheduler as used. Fails when it is already attached
    /// somewhere, preventing one instance from being a stream's top
    /// scheduler and a pooled work unit at the same time.
    pub(crate) fn associate(&self, usage: SchedUsed) -> Result<()> {
        let mut used = self.used.lock();
        if *used != SchedUsed::NotUsed {
            return Err(Error::Sched("scheduler already associated"));
        }
        *used = usage;
        Ok(())
    }

    pub(crate) fn deassociate(&self) {
        *self.used.lock() = SchedUsed::NotUsed;
    }

    /// Move `state` forward to `to`; regressions are ignored.
    pub(crate) fn advance_state(&self, to: SchedState) {
        let to = to as u8;
        let mut current = self.state.load(Ordering::Acquire);
        while current < to {
            match self
                .state
                .compare_exchange(current, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Record the driving stream and enter the RUNNING state.
    pub(crate) fn start_running(self: &Arc<Self>, xstream: &Arc<Xstream>) {
        *self.xstream.lock() = Arc::downgrade(xstream);
        self.advance_state(SchedState::Running);
    }

    /// Invoke the definition's scheduling loop.
    pub(crate) fn run_hook(self: &Arc<Self>) {
        self.def.run(self);
    }

    /// Stream currently driving this scheduler, if any.
    pub(crate) fn bound_xstream(&self) -> Option<Arc<Xstream>> {
        self.xstream.lock().upgrade()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("kind", &self.kind)
            .field("type", &self.sched_type)
            .field("state", &self.state())
            .field("used", &self.used())
            .field("automatic", &self.is_automatic())
            .field("num_pools", &self.num_pools())
            .field("size", &self.size())
            .field("total_size", &self.total_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolReader;
    use crate::xstream::XstreamId;

    struct NoopSched;

    impl SchedDef for NoopSched {
        fn run(&self, _sched: &Arc<Scheduler>) {}
    }

    struct FailingInit;

    impl SchedDef for FailingInit {
        fn init(&self, _sched: &Arc<Scheduler>, _config: &SchedConfig) -> Result<()> {
            Err(Error::Mem("no space for policy state".into()))
        }
        fn run(&self, _sched: &Arc<Scheduler>) {}
    }

    struct RejectingMigration {
        target: Arc<Pool>,
    }

    impl SchedDef for RejectingMigration {
        fn run(&self, _sched: &Arc<Scheduler>) {}
        fn migration_pool(&self, _sched: &Arc<Scheduler>) -> Option<Arc<Pool>> {
            Some(self.target.clone())
        }
    }

    fn fifo(access: PoolAccess) -> Arc<Pool> {
        Pool::create_basic(PoolKind::Fifo, access, false)
    }

    #[test]
    fn test_create_basic_default_topology() {
        let config = SchedConfig::default();
        let basic = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        assert_eq!(basic.num_pools(), 1);
        assert_eq!(basic.pools(1, 0).unwrap()[0].access(), PoolAccess::PrSw);
        assert!(basic.pools(1, 0).unwrap()[0].is_automatic());
        assert!(basic.is_automatic());

        let prio = Scheduler::create_basic(SchedPredef::Prio, 0, None, &config).unwrap();
        assert_eq!(prio.num_pools(), PRIO_LEVELS);
    }

    #[test]
    fn test_create_basic_inherits_configured_access() {
        let config = SchedConfig::default()
            .with_access(PoolAccess::SrSw)
            .with_automatic(false);
        let sched = Scheduler::create_basic(SchedPredef::Default, 1, None, &config).unwrap();
        assert_eq!(sched.pools(1, 0).unwrap()[0].access(), PoolAccess::SrSw);
        assert!(!sched.is_automatic());
    }

    #[test]
    fn test_kind_identity() {
        let config = SchedConfig::default();
        let basic = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        assert_eq!(basic.kind(), SchedKind::of::<BasicSched>());

        let user = Scheduler::create(NoopSched, vec![None], &config).unwrap();
        assert_eq!(user.kind(), SchedKind::of::<NoopSched>());
        assert_ne!(user.kind(), SchedKind::of::<BasicSched>());
    }

    #[test]
    fn test_create_retains_pools() {
        let pool = fifo(PoolAccess::PrSw);
        let config = SchedConfig::default();
        let sched =
            Scheduler::create(NoopSched, vec![Some(pool.clone()), Some(pool.clone())], &config)
                .unwrap();
        assert_eq!(pool.num_scheds(), 2);
        sched.free().unwrap();
        assert_eq!(pool.num_scheds(), 0);
    }

    #[test]
    fn test_failed_init_rolls_back_retains() {
        let pool = fifo(PoolAccess::PrSw);
        let config = SchedConfig::default();
        let result = Scheduler::create(FailingInit, vec![Some(pool.clone())], &config);
        assert!(matches!(result, Err(Error::Mem(_))));
        assert_eq!(pool.num_scheds(), 0);
    }

    #[test]
    fn test_pools_slice_out_of_range() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        assert!(sched.pools(1, 0).is_ok());
        assert!(matches!(sched.pools(2, 0), Err(Error::Sched(_))));
        assert!(matches!(sched.pools(1, 1), Err(Error::Sched(_))));
    }

    #[test]
    fn test_request_bits_idempotent() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        sched.finish();
        sched.finish();
        assert_eq!(sched.request_word(), REQ_FINISH);
        sched.exit();
        assert_eq!(sched.request_word(), REQ_FINISH | REQ_EXIT);
    }

    #[test]
    fn test_double_associate_fails() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        sched.associate(SchedUsed::Main).unwrap();
        assert!(matches!(
            sched.associate(SchedUsed::InPool),
            Err(Error::Sched(_))
        ));
        assert_eq!(sched.used(), SchedUsed::Main);
        sched.deassociate();
        sched.associate(SchedUsed::InPool).unwrap();
    }

    #[test]
    fn test_state_is_monotonic() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        assert_eq!(sched.state(), SchedState::Ready);
        sched.advance_state(SchedState::Stopping);
        assert_eq!(sched.state(), SchedState::Stopping);
        // regression attempts are ignored
        sched.advance_state(SchedState::Running);
        assert_eq!(sched.state(), SchedState::Stopping);
        sched.advance_state(SchedState::Terminated);
        assert_eq!(sched.state(), SchedState::Terminated);
    }

    #[test]
    fn test_has_to_stop_requires_attached_thread() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        sched.exit();
        assert!(matches!(sched.has_to_stop(), Err(Error::InvalidXstream)));
        // the request was not consumed: state did not move
        assert_eq!(sched.state(), SchedState::Ready);
    }

    #[test]
    fn test_data_slot_round_trip() {
        let config = SchedConfig::default();
        let sched = Scheduler::create(NoopSched, vec![None], &config).unwrap();
        sched.set_data(Box::new(7usize));
        assert_eq!(sched.with_data(|v: &mut usize| *v), Some(7));
        assert_eq!(sched.with_data(|v: &mut u32| *v), None);
        assert!(sched.take_data().is_some());
        assert!(sched.take_data().is_none());
    }

    #[test]
    fn test_migration_pool_terminated() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        sched.advance_state(SchedState::Terminated);
        let source = fifo(PoolAccess::PrSw);
        assert!(matches!(
            sched.migration_pool(&source),
            Err(Error::InvalidSched)
        ));
    }

    #[test]
    fn test_migration_pool_no_pools() {
        let config = SchedConfig::default();
        let sched = Scheduler::create(NoopSched, vec![], &config).unwrap();
        let source = fifo(PoolAccess::PrSw);
        assert!(matches!(
            sched.migration_pool(&source),
            Err(Error::InvalidSched)
        ));
    }

    #[test]
    fn test_migration_pool_rejection() {
        // the policy hands out a pool whose writer claim belongs to a
        // different stream than the source's reader
        let target = fifo(PoolAccess::PrPw);
        target.set_producer(XstreamId::new_for_test(1)).unwrap();
        let source = fifo(PoolAccess::PrSw);
        source
            .set_consumer(PoolReader::Stream(XstreamId::new_for_test(2)))
            .unwrap();

        let config = SchedConfig::default();
        let sched = Scheduler::create(
            RejectingMigration {
                target: target.clone(),
            },
            vec![None],
            &config,
        )
        .unwrap();
        assert!(matches!(
            sched.migration_pool(&source),
            Err(Error::InvalidPoolAccess)
        ));
    }

    #[test]
    fn test_free_destroys_automatic_pools() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        let pool = sched.pools(1, 0).unwrap().remove(0);
        let weak = Arc::downgrade(&pool);
        drop(pool);
        sched.free().unwrap();
        drop(sched);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_double_free_fails() {
        let config = SchedConfig::default();
        let sched = Scheduler::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        sched.free().unwrap();
        assert!(matches!(sched.free(), Err(Error::InvalidSched)));
    }

    #[test]
    fn test_predef_from_str() {
        assert_eq!("basic".parse::<SchedPredef>().unwrap(), SchedPredef::Basic);
        assert_eq!("prio".parse::<SchedPredef>().unwrap(), SchedPredef::Prio);
        assert!(matches!(
            "fancy".parse::<SchedPredef>(),
            Err(Error::InvalidSchedPredef)
        ));
    }
}
