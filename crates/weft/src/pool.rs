//! Pools of work units and their access-mode contract.
//!
//! A pool is an ordered multiset of [`Unit`]s with a declared access
//! mode. The access mode constrains which execution streams may push
//! (produce) and pop (consume): private roles are claimed by the first
//! stream that takes them and rejected for everyone else, shared roles
//! are open. Schedulers bind pools with a retain/release counter, and an
//! `automatic` pool is destroyed together with its last binding
//! scheduler.

use crate::error::{Error, Result};
use crate::sched::{SchedUsed, Scheduler};
use crate::unit::Unit;
use crate::xstream::{Xstream, XstreamId};
use log::trace;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Unique identifier for a pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PoolId(u64);

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

impl PoolId {
    fn new() -> Self {
        PoolId(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Which execution streams may push into and pop from a pool.
///
/// `P` = private (single stream, claimed on first use), `S` = shared,
/// `R` = reader (popper), `W` = writer (pusher). `Prw` is fully private:
/// one stream owns both roles.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolAccess {
    /// Single stream reads and writes
    Prw,
    /// Private reader, private writer (may be two different streams)
    PrPw,
    /// Private reader, shared writers (MPSC); the default
    PrSw,
    /// Shared readers, private writer
    SrPw,
    /// Shared readers, shared writers
    SrSw,
}

impl Default for PoolAccess {
    fn default() -> Self {
        PoolAccess::PrSw
    }
}

impl PoolAccess {
    /// True when any stream may pop.
    pub fn is_shared_reader(self) -> bool {
        matches!(self, PoolAccess::SrPw | PoolAccess::SrSw)
    }

    /// True when any stream may push.
    pub fn is_shared_writer(self) -> bool {
        matches!(self, PoolAccess::PrSw | PoolAccess::SrSw)
    }
}

/// Built-in pool kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// First-in first-out queue
    Fifo,
}

/// Ordered container driven by a pool.
///
/// Implementations are single-threaded; the pool serializes access.
pub trait PoolPolicy: Send {
    /// Append a unit.
    fn push(&mut self, unit: Unit);
    /// Take the next unit.
    fn pop(&mut self) -> Option<Unit>;
    /// Remove a specific unit; true if it was present.
    fn remove(&mut self, unit: &Unit) -> bool;
    /// Number of queued units.
    fn len(&self) -> usize;
    /// True when no units are queued.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct FifoPolicy {
    queue: VecDeque<Unit>,
}

impl FifoPolicy {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl PoolPolicy for FifoPolicy {
    fn push(&mut self, unit: Unit) {
        self.queue.push_back(unit);
    }

    fn pop(&mut self) -> Option<Unit> {
        self.queue.pop_front()
    }

    fn remove(&mut self, unit: &Unit) -> bool {
        match self.queue.iter().position(|u| u.same(unit)) {
            Some(idx) => self.queue.remove(idx).is_some(),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// The reader a pool is asked to accept.
///
/// `Any` stands for "some stream, unknown which": units adopted through a
/// shared-reader pool may end up on any stream, so their own pools must
/// tolerate arbitrary readers.
#[derive(Copy, Clone)]
pub(crate) enum PoolReader {
    /// A specific execution stream
    Stream(XstreamId),
    /// Unknown; only shared-reader pools accept this
    Any,
}

#[derive(Default)]
struct Claims {
    consumer: Option<XstreamId>,
    producer: Option<XstreamId>,
}

/// An ordered multiset of work units with an access-mode contract.
pub struct Pool {
    id: PoolId,
    access: PoolAccess,
    automatic: bool,
    policy: Mutex<Box<dyn PoolPolicy>>,
    claims: Mutex<Claims>,
    num_scheds: AtomicI32,
    num_blocked: AtomicUsize,
    num_migrating: AtomicUsize,
}

impl Pool {
    /// Create a pool around a custom policy.
    pub fn create(policy: Box<dyn PoolPolicy>, access: PoolAccess, automatic: bool) -> Arc<Pool> {
        Arc::new(Pool {
            id: PoolId::new(),
            access,
            automatic,
            policy: Mutex::new(policy),
            claims: Mutex::new(Claims::default()),
            num_scheds: AtomicI32::new(0),
            num_blocked: AtomicUsize::new(0),
            num_migrating: AtomicUsize::new(0),
        })
    }

    /// Create a pool with a built-in policy.
    pub fn create_basic(kind: PoolKind, access: PoolAccess, automatic: bool) -> Arc<Pool> {
        let policy: Box<dyn PoolPolicy> = match kind {
            PoolKind::Fifo => Box::new(FifoPolicy::new()),
        };
        Pool::create(policy, access, automatic)
    }

    /// Identifier of this pool.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Access mode; immutable after creation.
    pub fn access(&self) -> PoolAccess {
        self.access
    }

    /// True when the pool's lifetime is tied to its binding schedulers.
    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    /// Number of schedulers currently binding this pool.
    pub fn num_scheds(&self) -> i32 {
        self.num_scheds.load(Ordering::Acquire)
    }

    /// Number of queued units. Excludes blocked and migrating ones.
    pub fn size(&self) -> usize {
        self.policy.lock().len()
    }

    /// Number of units the pool is responsible for, including blocked
    /// and in-flight migrating ones.
    pub fn total_size(&self) -> usize {
        self.size()
            + self.num_blocked.load(Ordering::Acquire)
            + self.num_migrating.load(Ordering::Acquire)
    }

    pub(crate) fn retain(&self) -> i32 {
        self.num_scheds.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release(&self) -> i32 {
        self.num_scheds.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn push(&self, unit: Unit) {
        self.policy.lock().push(unit);
    }

    /// Take the next unit. Scheduling loops call this; reader claims are
    /// made when a scheduler is attached, not per pop.
    pub fn pop(&self) -> Option<Unit> {
        self.policy.lock().pop()
    }

    pub(crate) fn remove(&self, unit: &Unit) -> bool {
        self.policy.lock().remove(unit)
    }

    /// Drop all queued units. Used when an automatic pool dies with its
    /// last binding scheduler.
    pub(crate) fn discard(&self) {
        let mut policy = self.policy.lock();
        while policy.pop().is_some() {}
    }

    pub(crate) fn inc_blocked(&self) {
        self.num_blocked.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_blocked(&self) {
        self.num_blocked.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn inc_migrating(&self) {
        self.num_migrating.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_migrating(&self) {
        self.num_migrating.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn consumer(&self) -> Option<XstreamId> {
        self.claims.lock().consumer
    }

    /// Register `xstream` as a writer of this pool.
    ///
    /// For `Prw` the producer slot is claimed before the reader check, and
    /// the claim persists even when that check fails. That asymmetry is
    /// part of the access-matrix contract, not an oversight.
    pub(crate) fn set_producer(&self, xstream: XstreamId) -> Result<()> {
        let mut claims = self.claims.lock();
        match self.access {
            PoolAccess::Prw => {
                if let Some(producer) = claims.producer {
                    if producer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                claims.producer = Some(xstream);
                if let Some(consumer) = claims.consumer {
                    if consumer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                Ok(())
            }
            PoolAccess::PrPw | PoolAccess::SrPw => {
                if let Some(producer) = claims.producer {
                    if producer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                claims.producer = Some(xstream);
                Ok(())
            }
            PoolAccess::PrSw | PoolAccess::SrSw => Ok(()),
        }
    }

    /// Register a reader of this pool.
    pub(crate) fn set_consumer(&self, reader: PoolReader) -> Result<()> {
        let xstream = match reader {
            PoolReader::Any => {
                return if self.access.is_shared_reader() {
                    Ok(())
                } else {
                    Err(Error::InvalidPoolAccess)
                };
            }
            PoolReader::Stream(id) => id,
        };
        let mut claims = self.claims.lock();
        match self.access {
            PoolAccess::Prw => {
                if let Some(consumer) = claims.consumer {
                    if consumer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                claims.consumer = Some(xstream);
                if let Some(producer) = claims.producer {
                    if producer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                Ok(())
            }
            PoolAccess::PrPw | PoolAccess::PrSw => {
                if let Some(consumer) = claims.consumer {
                    if consumer != xstream {
                        return Err(Error::InvalidPoolAccess);
                    }
                }
                claims.consumer = Some(xstream);
                Ok(())
            }
            PoolAccess::SrPw | PoolAccess::SrSw => Ok(()),
        }
    }

    /// Whether this pool accepts a unit migrating out of `source`.
    ///
    /// Private-writer targets require the stream draining the source to
    /// already be this pool's registered writer; shared-writer targets
    /// accept anyone.
    pub fn accept_migration(&self, source: &Pool) -> bool {
        match self.access {
            PoolAccess::Prw | PoolAccess::PrPw | PoolAccess::SrPw => {
                // take the two claim locks in sequence, never nested
                let source_consumer = source.claims.lock().consumer;
                self.claims.lock().producer == source_consumer
            }
            PoolAccess::PrSw | PoolAccess::SrSw => true,
        }
    }

    /// Bind `sched` into this pool as a work unit.
    ///
    /// The stream that pops it will drive the scheduler's loop, which
    /// makes that stream a reader of every pool `sched` binds; all of
    /// those adoption claims must pass before the unit is queued.
    pub fn add_sched(self: &Arc<Self>, sched: &Arc<Scheduler>) -> Result<()> {
        let xstream = Xstream::current().ok_or(Error::InvalidXstream)?;
        sched.associate(SchedUsed::InPool)?;

        if let Err(e) = self.set_producer(xstream.id()) {
            sched.deassociate();
            return Err(e);
        }

        let reader = if self.access.is_shared_reader() {
            Some(PoolReader::Any)
        } else {
            // reader unknown until this pool is attached to a stream;
            // adoption claims then happen at attachment
            self.consumer().map(PoolReader::Stream)
        };
        if let Some(reader) = reader {
            for pool in sched.pool_list() {
                if let Err(e) = pool.set_consumer(reader) {
                    sched.deassociate();
                    return Err(e);
                }
            }
        }

        trace!("sched bound as unit into pool {:?}", self.id);
        self.push(Unit::Sched(sched.clone()));
        Ok(())
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("access", &self.access)
            .field("automatic", &self.automatic)
            .field("num_scheds", &self.num_scheds())
            .field("size", &self.size())
            .field("total_size", &self.total_size())
            .finish()
    }
}
