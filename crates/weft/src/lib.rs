//! Weft — a lightweight user-level threading runtime.
//!
//! Weft executes large numbers of cheap, cooperatively switched work
//! units over a small set of OS-level execution streams:
//! - **Pools**: ordered multisets of work units with an access-mode
//!   contract (`pool` module)
//! - **Schedulers**: pluggable policies bound to pools, steered through
//!   a finish/exit request protocol (`sched` module)
//! - **Execution streams**: OS workers hosting stacks of schedulers
//!   (`xstream` module)
//! - **Work units**: user-level threads with their own context and
//!   run-to-completion tasklets (`ult`, `task` modules)
//!
//! # Example
//!
//! ```rust,ignore
//! use weft::{Runtime, Task, Xstream};
//!
//! let runtime = Runtime::init()?;
//! let xstream = Xstream::create(None)?;
//! let pool = xstream.main_pools(1)?.remove(0);
//! let task = Task::create(&pool, || println!("hello from a tasklet"))?;
//! task.join();
//! xstream.join();
//! runtime.finalize();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod runtime;
pub mod sched;
pub mod task;
pub mod ult;
pub mod unit;
pub mod xstream;

mod context;

pub use config::{SchedConfig, DEFAULT_EVENT_FREQ};
pub use error::{Error, Result};
pub use pool::{Pool, PoolAccess, PoolId, PoolKind, PoolPolicy};
pub use runtime::{num_xstreams, yield_now, Runtime};
pub use sched::{
    BasicSched, PrioSched, SchedDef, SchedKind, SchedPredef, SchedState, SchedType, SchedUsed,
    Scheduler, PRIO_LEVELS,
};
pub use task::{Task, TaskId, TaskState};
pub use ult::{Ult, UltId, UltState};
pub use unit::Unit;
pub use xstream::{Xstream, XstreamId, XstreamState};
