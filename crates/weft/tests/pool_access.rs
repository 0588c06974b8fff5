//! Pool access-mode matrix scenarios.
//!
//! Three families of checks, one per way a foreign stream can reach a
//! pool: binding a scheduler-as-unit into another stream's pool, binding
//! across access modes from a task on the stream, and pushing work into
//! a stream's main pool from outside.

use parking_lot::Mutex;
use std::sync::Arc;
use weft::{
    Error, Pool, PoolAccess, PoolKind, Runtime, SchedConfig, SchedPredef, Scheduler, Task, Xstream,
};

const ACCESSES: [PoolAccess; 5] = [
    PoolAccess::Prw,
    PoolAccess::PrPw,
    PoolAccess::PrSw,
    PoolAccess::SrPw,
    PoolAccess::SrSw,
];

fn sched_bound_to(pool: &Arc<Pool>) -> Arc<Scheduler> {
    Scheduler::create_basic(
        SchedPredef::Basic,
        1,
        Some(vec![pool.clone()]),
        &SchedConfig::new(),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Scenario: bind a scheduler sharing a pool into another stream
// ---------------------------------------------------------------------------

fn add_to_another_stream(access: PoolAccess, should_succeed: bool) {
    let runtime = Runtime::init().unwrap();
    let pool = Pool::create_basic(PoolKind::Fifo, access, false);
    let scheds: Vec<_> = (0..3).map(|_| sched_bound_to(&pool)).collect();

    let xs1 = Xstream::create(None).unwrap();
    let xs2 = Xstream::create(None).unwrap();
    let pool1 = xs1.main_pools(1).unwrap().remove(0);
    let pool2 = xs2.main_pools(1).unwrap().remove(0);

    // two schedulers reading the shared pool on the same stream is
    // always fine
    pool1.add_sched(&scheds[0]).unwrap();
    pool1.add_sched(&scheds[1]).unwrap();

    // the third would make a second stream a reader of the shared pool
    let result = pool2.add_sched(&scheds[2]);

    xs1.join();
    xs2.join();

    if should_succeed {
        assert!(result.is_ok(), "access {:?} must accept a second stream", access);
    } else {
        assert!(
            matches!(result, Err(Error::InvalidPoolAccess)),
            "access {:?} must reject a second stream",
            access
        );
        scheds[2].free().unwrap();
    }
    assert_eq!(pool.num_scheds(), 0);
    runtime.finalize();
}

#[test]
fn test_add_to_another_stream_prw() {
    add_to_another_stream(PoolAccess::Prw, false);
}

#[test]
fn test_add_to_another_stream_pr_pw() {
    add_to_another_stream(PoolAccess::PrPw, false);
}

#[test]
fn test_add_to_another_stream_pr_sw() {
    add_to_another_stream(PoolAccess::PrSw, false);
}

#[test]
fn test_add_to_another_stream_sr_pw() {
    add_to_another_stream(PoolAccess::SrPw, true);
}

#[test]
fn test_add_to_another_stream_sr_sw() {
    add_to_another_stream(PoolAccess::SrSw, true);
}

// ---------------------------------------------------------------------------
// Scenario: bind across access modes from a task on the stream
// ---------------------------------------------------------------------------

fn add_to_another_access(row: PoolAccess, expected: [bool; 5]) {
    let runtime = Runtime::init().unwrap();
    for (column, &dest_access) in ACCESSES.iter().enumerate() {
        let config = SchedConfig::new().with_access(PoolAccess::PrSw);
        let xstream = Xstream::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
        let pool_main = xstream.main_pools(1).unwrap().remove(0);

        let pool_dest = Pool::create_basic(PoolKind::Fifo, dest_access, false);
        let sched_dest = sched_bound_to(&pool_dest);
        let pool_row = Pool::create_basic(PoolKind::Fifo, row, false);
        let sched_row = sched_bound_to(&pool_row);

        let first = Arc::new(Mutex::new(None));
        let second = Arc::new(Mutex::new(None));
        {
            let bind_main = pool_main.clone();
            let pool_dest = pool_dest.clone();
            let sched_dest = sched_dest.clone();
            let sched_row = sched_row.clone();
            let first = first.clone();
            let second = second.clone();
            Task::create(&pool_main, move || {
                *first.lock() = Some(bind_main.add_sched(&sched_dest).is_ok());
                *second.lock() = Some(pool_dest.add_sched(&sched_row).is_ok());
            })
            .unwrap();
        }
        xstream.join();

        assert_eq!(first.lock().take(), Some(true));
        let ok = second.lock().take().unwrap();
        assert_eq!(
            ok, expected[column],
            "row {:?} into dest {:?}",
            row, dest_access
        );
        if !ok {
            sched_row.free().unwrap();
        }
    }
    runtime.finalize();
}

#[test]
fn test_add_to_another_access_prw() {
    add_to_another_access(PoolAccess::Prw, [true, true, true, false, false]);
}

#[test]
fn test_add_to_another_access_pr_pw() {
    add_to_another_access(PoolAccess::PrPw, [true, true, true, false, false]);
}

#[test]
fn test_add_to_another_access_pr_sw() {
    add_to_another_access(PoolAccess::PrSw, [true, true, true, false, false]);
}

#[test]
fn test_add_to_another_access_sr_pw() {
    add_to_another_access(PoolAccess::SrPw, [true, true, true, true, true]);
}

#[test]
fn test_add_to_another_access_sr_sw() {
    add_to_another_access(PoolAccess::SrSw, [true, true, true, true, true]);
}

// ---------------------------------------------------------------------------
// Scenario: push into a stream's main pool from outside, then from a
// task running on the stream itself
// ---------------------------------------------------------------------------

fn push_from_another_stream(access: PoolAccess, outer_ok: bool, inner_ok: bool) {
    let runtime = Runtime::init().unwrap();
    let config = SchedConfig::new().with_access(access);
    let xstream = Xstream::create_basic(SchedPredef::Basic, 1, None, &config).unwrap();
    let pool = xstream.main_pools(1).unwrap().remove(0);

    let inner = Arc::new(Mutex::new(None));
    let outer = {
        let inner = inner.clone();
        Task::create(&pool, move || {
            let xstream = Xstream::current().unwrap();
            let pool = xstream.main_pools(1).unwrap().remove(0);
            *inner.lock() = Some(Task::create(&pool, || {}).is_ok());
        })
    };

    if outer_ok {
        assert!(outer.is_ok(), "outer push must pass for {:?}", access);
    } else {
        assert!(
            matches!(outer, Err(Error::InvalidPoolAccess)),
            "outer push must fail for {:?}",
            access
        );
    }
    xstream.join();
    if outer_ok {
        assert_eq!(
            inner.lock().take(),
            Some(inner_ok),
            "recursive push for {:?}",
            access
        );
    }
    runtime.finalize();
}

#[test]
fn test_push_from_another_stream_prw() {
    push_from_another_stream(PoolAccess::Prw, false, false);
}

#[test]
fn test_push_from_another_stream_pr_pw() {
    push_from_another_stream(PoolAccess::PrPw, true, false);
}

#[test]
fn test_push_from_another_stream_pr_sw() {
    push_from_another_stream(PoolAccess::PrSw, true, true);
}

#[test]
fn test_push_from_another_stream_sr_pw() {
    push_from_another_stream(PoolAccess::SrPw, true, false);
}

#[test]
fn test_push_from_another_stream_sr_sw() {
    push_from_another_stream(PoolAccess::SrSw, true, true);
}
