use crate::vm::interrupt::{Interrupted, NativeThread};

/// One attempt at a wait that may block and may be interrupted.
///
/// An attempt either produces a definite output or reports [`Interrupted`];
/// interrupted attempts are retried by
/// [`ThreadManager::run_until_result`](crate::vm::ThreadManager::run_until_result)
/// after it has served any pending safepoint actions, so implementations must
/// recompute whatever budget they have left on each call.
pub trait BlockingAction {
    type Output;

    fn block(&mut self, native: &NativeThread) -> Result<Self::Output, Interrupted>;
}

impl<T, F> BlockingAction for F
where
    F: FnMut(&NativeThread) -> Result<T, Interrupted>,
{
    type Output = T;

    fn block(&mut self, native: &NativeThread) -> Result<T, Interrupted> {
        self(native)
    }
}
