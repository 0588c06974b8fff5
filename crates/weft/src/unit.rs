//! Work units held in pools.

use crate::sched::Scheduler;
use crate::task::Task;
use crate::ult::Ult;
use std::fmt;
use std::sync::Arc;

/// A schedulable unit of work.
///
/// Pools are ordered multisets of these. A unit is either a user-level
/// thread (own context, may yield), a run-to-completion tasklet, or a
/// whole scheduler bound into the pool to be driven by whoever pops it.
#[derive(Clone)]
pub enum Unit {
    /// User-level thread
    Ult(Arc<Ult>),
    /// Run-to-completion tasklet
    Task(Arc<Task>),
    /// Scheduler running as a work unit
    Sched(Arc<Scheduler>),
}

impl Unit {
    /// Identity comparison: true when both refer to the same unit.
    pub fn same(&self, other: &Unit) -> bool {
        match (self, other) {
            (Unit::Ult(a), Unit::Ult(b)) => Arc::ptr_eq(a, b),
            (Unit::Task(a), Unit::Task(b)) => Arc::ptr_eq(a, b),
            (Unit::Sched(a), Unit::Sched(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// True for [`Unit::Ult`].
    pub fn is_ult(&self) -> bool {
        matches!(self, Unit::Ult(_))
    }

    /// True for [`Unit::Task`].
    pub fn is_task(&self) -> bool {
        matches!(self, Unit::Task(_))
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Ult(u) => write!(f, "Unit::Ult({:?})", u.id()),
            Unit::Task(t) => write!(f, "Unit::Task({:?})", t.id()),
            Unit::Sched(s) => write!(f, "Unit::Sched({:?})", s.kind()),
        }
    }
}
