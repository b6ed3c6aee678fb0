use crate::{
    utils::sync::{Arc, Condvar, Mutex},
    vm::interrupt::{wait_interruptibly, Blocker, Interrupted, NativeThread},
};
use std::time::Instant;

/// A single-fire latch marking a guest thread's termination.
///
/// Everything a thread writes before [`fire`](Self::fire) is visible to any
/// thread that afterwards observes the signal as fired, since both sides go
/// through the same mutex.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal and wake every waiter.
    /// Returns false if it had already fired.
    pub fn fire(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        self.condvar.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock()
    }

    /// Remaining count in latch terms: 1 until fired, then 0.
    pub fn count(&self) -> usize {
        if self.is_fired() {
            0
        } else {
            1
        }
    }

    /// Block until fired, `deadline` passes, or `native` is interrupted.
    ///
    /// At the deadline the authoritative fired state is returned rather than
    /// the outcome of the timed wait.
    pub fn wait(
        self: &Arc<Self>,
        native: &NativeThread,
        deadline: Option<Instant>,
    ) -> Result<bool, Interrupted> {
        wait_interruptibly(
            native,
            self.clone(),
            &self.fired,
            &self.condvar,
            deadline,
            |fired| *fired,
        )
    }

    /// Block until fired or `deadline` passes, ignoring interrupts. Guest
    /// code waits through [`wait`](Self::wait); this is for runtime teardown,
    /// which runs on the root after its guest work has ended.
    pub fn wait_uninterruptibly(&self, deadline: Instant) -> bool {
        let mut fired = self.fired.lock();
        while !*fired {
            if self.condvar.wait_until(&mut fired, deadline).timed_out() {
                break;
            }
        }
        *fired
    }
}

impl Blocker for CompletionSignal {
    fn unblock(&self) {
        let _fired = self.fired.lock();
        self.condvar.notify_all();
    }
}
