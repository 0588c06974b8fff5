//! Run-to-completion tasklets.
//!
//! A tasklet executes once on the dispatching stream, borrowing that
//! stream's context; it cannot yield. Use a [`crate::ult::Ult`] for work
//! that needs its own context.

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::unit::Unit;
use crate::xstream::Xstream;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a tasklet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric ID value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// State of a tasklet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created and queued, not yet picked up
    Created,
    /// Currently executing on a stream
    Running,
    /// Finished
    Completed,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Created,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }
}

/// A run-to-completion work unit.
pub struct Task {
    id: TaskId,
    body: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    state: AtomicU8,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl Task {
    /// Create a tasklet and push it into `pool`.
    ///
    /// The calling thread must be attached to an execution stream; the
    /// pool's access mode decides whether that stream may push here.
    pub fn create<F>(pool: &Arc<Pool>, body: F) -> Result<Arc<Task>>
    where
        F: FnOnce() + Send + 'static,
    {
        let xstream = Xstream::current().ok_or(Error::InvalidXstream)?;
        pool.set_producer(xstream.id())?;

        let task = Arc::new(Task {
            id: TaskId::new(),
            body: Mutex::new(Some(Box::new(body))),
            state: AtomicU8::new(TaskState::Created as u8),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        });
        pool.push(Unit::Task(task.clone()));
        Ok(task)
    }

    /// Build a tasklet without queueing it anywhere. Test scaffolding.
    #[cfg(test)]
    pub(crate) fn raw<F>(body: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            id: TaskId::new(),
            body: Mutex::new(Some(Box::new(body))),
            state: AtomicU8::new(TaskState::Created as u8),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        }
    }

    /// Identifier of this tasklet.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run the body. Called exactly once, by the dispatching stream.
    pub(crate) fn execute(&self) {
        let body = self.body.lock().take();
        self.state.store(TaskState::Running as u8, Ordering::Release);
        if let Some(body) = body {
            body();
        }
        self.state.store(TaskState::Completed as u8, Ordering::Release);
        let mut done = self.done.lock();
        *done = true;
        self.done_cv.notify_all();
    }

    /// Wait until the tasklet has completed.
    ///
    /// A caller on a primary stream's main context keeps scheduling while
    /// it waits; other callers block on a condvar.
    pub fn join(&self) {
        loop {
            if *self.done.lock() {
                return;
            }
            if !crate::runtime::yield_now() {
                break;
            }
            std::thread::yield_now();
        }
        let mut done = self.done.lock();
        while !*done {
            self.done_cv.wait(&mut done);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{PoolAccess, PoolKind};

    #[test]
    fn test_create_requires_attached_thread() {
        // plain test threads are not attached to any execution stream
        let pool = Pool::create_basic(PoolKind::Fifo, PoolAccess::PrSw, false);
        let result = Task::create(&pool, || {});
        assert!(matches!(result, Err(Error::InvalidXstream)));
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_execute_transitions_and_wakes_joiners() {
        let task = Arc::new(Task::raw(|| {}));
        assert_eq!(task.state(), TaskState::Created);
        task.execute();
        assert_eq!(task.state(), TaskState::Completed);
        // join after completion returns immediately
        task.join();
    }
}
