//! Cooperative context-switch primitive.
//!
//! A `Context` is the parking spot for one flow of control: every
//! user-level thread and every execution stream's scheduling loop owns
//! one. `context_switch` hands the processor from the calling context to
//! another and returns when somebody hands it back. Contexts are carried
//! by parked OS threads, so a switch is a wake plus a park; the runtime
//! never allocates or swaps stacks itself.

use parking_lot::{Condvar, Mutex};

pub(crate) struct Context {
    resumed: Mutex<bool>,
    cv: Condvar,
}

impl Context {
    pub(crate) fn new() -> Self {
        Self {
            resumed: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Park the carrier of this context until another context resumes it.
    ///
    /// A resume that lands before the carrier parks is not lost; the
    /// flag makes the pair order-insensitive.
    pub(crate) fn suspend(&self) {
        let mut resumed = self.resumed.lock();
        while !*resumed {
            self.cv.wait(&mut resumed);
        }
        *resumed = false;
    }

    /// Mark this context runnable and wake its carrier.
    pub(crate) fn resume(&self) {
        let mut resumed = self.resumed.lock();
        *resumed = true;
        self.cv.notify_one();
    }
}

/// Transfer control from `from` to `to`.
///
/// Must be called by the thread carrying `from`; returns once `from` is
/// resumed again.
pub(crate) fn context_switch(from: &Context, to: &Context) {
    to.resume();
    from.suspend();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resume_before_suspend_is_not_lost() {
        let ctx = Context::new();
        ctx.resume();
        // would hang if the early resume were dropped
        ctx.suspend();
    }

    #[test]
    fn test_ping_pong() {
        let a = Arc::new(Context::new());
        let b = Arc::new(Context::new());
        let (ta, tb) = (a.clone(), b.clone());

        let handle = thread::spawn(move || {
            tb.suspend();
            for _ in 0..100 {
                context_switch(&tb, &ta);
            }
            ta.resume();
        });

        b.resume();
        for _ in 0..100 {
            context_switch(&a, &b);
        }
        handle.join().unwrap();
    }
}
