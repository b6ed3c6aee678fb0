//! Native thread handles and interruptible waits.
//!
//! Rust gives no way to break another OS thread out of a blocking call, so the
//! runtime only ever blocks through [`wait_interruptibly`]. A waiting thread
//! publishes the primitive it sleeps on in its [`NativeThread`] blocker slot;
//! [`NativeThread::interrupt`] raises a sticky flag and then pokes that
//! primitive. The flag is checked under the primitive's own mutex before every
//! wait, so an interrupt can never fall between the check and the sleep.
use crate::utils::sync::{Arc, AtomicBool, Condvar, Mutex, Ordering};
use std::{
    fmt,
    thread::{self, ThreadId},
    time::Instant,
};
use thiserror::Error;

/// A blocking attempt was cut short by [`NativeThread::interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Something a native thread can be blocked on.
///
/// `unblock` must take the same mutex the waiter checks its condition under
/// before notifying.
pub trait Blocker: Send + Sync {
    fn unblock(&self);
}

/// Handle to the OS thread currently executing a guest thread's root fiber.
pub struct NativeThread {
    id: ThreadId,
    name: Option<String>,
    interrupted: AtomicBool,
    blocker: Mutex<Option<Arc<dyn Blocker>>>,
    park: Arc<Park>,
}

impl NativeThread {
    /// Create a handle for the calling OS thread.
    pub fn current() -> Arc<Self> {
        let current = thread::current();
        Arc::new(Self {
            id: current.id(),
            name: current.name().map(str::to_string),
            interrupted: AtomicBool::new(false),
            blocker: Mutex::new(None),
            park: Arc::new(Park::default()),
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Break this thread out of whatever interruptible wait it is in, or make
    /// its next one return [`Interrupted`] immediately.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let blocker = self.blocker.lock().clone();
        if let Some(blocker) = blocker {
            blocker.unblock();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Consume a pending interrupt.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn block_on(&self, blocker: Arc<dyn Blocker>) -> BlockerGuard<'_> {
        *self.blocker.lock() = Some(blocker);
        BlockerGuard { native: self }
    }

    /// Park the calling thread until `deadline` or an interrupt. Must only be
    /// called from the thread this handle belongs to.
    pub fn park(&self, deadline: Option<Instant>) -> Result<(), Interrupted> {
        debug_assert_eq!(thread::current().id(), self.id);
        let park = self.park.clone();
        wait_interruptibly(self, park.clone(), &park.lock, &park.condvar, deadline, |_| false)
            .map(|_| ())
    }
}

impl fmt::Debug for NativeThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Clears the blocker slot when the wait ends, on every exit path.
pub(crate) struct BlockerGuard<'a> {
    native: &'a NativeThread,
}

impl Drop for BlockerGuard<'_> {
    fn drop(&mut self) {
        *self.native.blocker.lock() = None;
    }
}

/// The per-thread primitive used for plain sleeps.
#[derive(Default)]
struct Park {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Blocker for Park {
    fn unblock(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}

/// Wait on `condvar` until `ready` holds, `deadline` passes, or `native` is
/// interrupted.
///
/// Returns `Ok(true)` once `ready` holds and `Ok(false)` at the deadline. On a
/// timeout `ready` is evaluated one final time under the lock, so a condition
/// that became true just before the deadline is still reported. `ready` may
/// mutate the state, e.g. to take ownership of a lock it found free.
pub(crate) fn wait_interruptibly<S>(
    native: &NativeThread,
    blocker: Arc<dyn Blocker>,
    state: &Mutex<S>,
    condvar: &Condvar,
    deadline: Option<Instant>,
    mut ready: impl FnMut(&mut S) -> bool,
) -> Result<bool, Interrupted> {
    // Order matters: the guard must outlive the state lock.
    let _blocking = native.block_on(blocker);
    let mut guard = state.lock();
    loop {
        if ready(&mut guard) {
            return Ok(true);
        }
        if native.take_interrupt() {
            return Err(Interrupted);
        }
        match deadline {
            Some(deadline) => {
                if condvar.wait_until(&mut guard, deadline).timed_out() {
                    return Ok(ready(&mut guard));
                }
            }
            None => condvar.wait(&mut guard),
        }
    }
}
