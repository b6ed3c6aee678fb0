//! Cross-thread actions delivered at cooperative poll points.
//!
//! There is no preemption: [`SafepointCoordinator::pause_thread_and_execute_later`]
//! drops the action into the target's pending queue and interrupts the target's
//! native thread, then returns. The target runs the action itself the next
//! time it polls, either explicitly through [`ThreadContext::safepoint`] or
//! because an interrupted blocking wait polls before retrying. Because actions
//! run on the target, they may touch state only the target itself may mutate,
//! such as its owned locks.
//!
//! Whether queued actions run at a given poll depends on the target's
//! [`InterruptMode`](crate::vm::InterruptMode); actions that are not allowed
//! yet simply stay queued.
use crate::{
    utils::sync::Arc,
    value::Unwind,
    vm::{
        context::ThreadContext, interrupt::NativeThread, metrics::RuntimeMetrics,
        registry::ThreadRegistry, thread::GuestThread, thread::ThreadStatus,
    },
};
use tracing::trace;

/// An action to run on a target thread at its next allowed poll point.
/// Returning an `Unwind` starts unwinding the target's task.
pub type SafepointAction = Box<dyn FnOnce(&ThreadContext) -> Result<(), Unwind> + Send>;

/// Where a thread is polling from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSite {
    /// An explicit poll in running code
    Running,
    /// An interrupted blocking wait, before it retries
    Blocking,
}

pub struct SafepointCoordinator {
    registry: Arc<ThreadRegistry>,
    metrics: Arc<RuntimeMetrics>,
}

impl SafepointCoordinator {
    pub fn new(registry: Arc<ThreadRegistry>, metrics: Arc<RuntimeMetrics>) -> Self {
        Self { registry, metrics }
    }

    /// Schedule `action` to run on the guest thread bound to `target`.
    ///
    /// Returns immediately. Returns false, without error, if no live guest
    /// thread is bound to `target` any more.
    pub fn pause_thread_and_execute_later<F>(&self, target: &NativeThread, action: F) -> bool
    where
        F: FnOnce(&ThreadContext) -> Result<(), Unwind> + Send + 'static,
    {
        let Some(thread) = self.registry.find_by_native(target.id()) else {
            trace!(native = ?target.id(), "safepoint target is gone");
            return false;
        };
        if thread.status() == ThreadStatus::Dead {
            return false;
        }
        if !thread.enqueue_action(Box::new(action)) {
            trace!(thread = thread.id(), "safepoint target already cleaned up");
            return false;
        }
        target.interrupt();
        trace!(thread = thread.id(), "safepoint action scheduled");
        true
    }

    /// Schedule `action` on every registered thread, the caller's included.
    ///
    /// Each thread runs the action once before it resumes; there is no
    /// ordering between threads. Returns the number of threads reached.
    pub fn pause_all_threads_and_execute_later<F>(&self, action: F) -> usize
    where
        F: Fn(&ThreadContext) -> Result<(), Unwind> + Send + Sync + 'static,
    {
        let action = Arc::new(action);
        let mut reached = 0;
        for thread in self.registry.snapshot() {
            let Some(native) = thread.native_thread() else {
                continue;
            };
            let action = action.clone();
            if self.pause_thread_and_execute_later(&native, move |ctx| action(ctx)) {
                reached += 1;
            }
        }
        reached
    }

    /// Run the calling thread's pending actions, if its interrupt mode allows
    /// them at this kind of poll point.
    pub fn poll(&self, ctx: &ThreadContext, site: PollSite) -> Result<(), Unwind> {
        let thread = ctx.thread();
        while thread.interrupt_mode().allows(site) {
            let Some(action) = thread.next_action() else {
                break;
            };
            self.metrics.record_safepoint_action();
            trace!(thread = thread.id(), ?site, "running safepoint action");
            action(ctx)?;
        }
        Ok(())
    }

    /// Drop everything still queued for a thread that is going away.
    pub(crate) fn discard_pending(&self, thread: &GuestThread) -> usize {
        thread.close_actions()
    }
}
