//! The guest-facing thread API.
//!
//! A [`ThreadContext`] is the handle a guest task runs with. It is tied to the
//! native thread it was created on, which is why it is neither `Send` nor
//! `Sync`: every blocking operation it offers waits on that thread's
//! [`NativeThread`] and every lock it takes is recorded as owned by its
//! [`GuestThread`].
use crate::{
    error::ThreadError,
    utils::sync::Arc,
    value::{Unwind, Value},
    vm::{
        blocking::BlockingAction,
        interrupt::NativeThread,
        locks::GuestMutex,
        safepoint::PollSite,
        thread::{GuestThread, InterruptMode},
        threading::ThreadManager,
    },
};
use std::{
    marker::PhantomData,
    thread,
    time::{Duration, Instant},
};

pub struct ThreadContext {
    manager: Arc<ThreadManager>,
    thread: Arc<GuestThread>,
    native: Arc<NativeThread>,
    _not_send: PhantomData<*const ()>,
}

impl ThreadContext {
    pub(crate) fn new(
        manager: Arc<ThreadManager>,
        thread: Arc<GuestThread>,
        native: Arc<NativeThread>,
    ) -> Self {
        Self {
            manager,
            thread,
            native,
            _not_send: PhantomData,
        }
    }

    pub fn manager(&self) -> &Arc<ThreadManager> {
        &self.manager
    }

    pub fn thread(&self) -> &Arc<GuestThread> {
        &self.thread
    }

    pub fn native(&self) -> &Arc<NativeThread> {
        &self.native
    }

    /// Cooperative poll point: run pending safepoint actions the current
    /// interrupt mode allows.
    pub fn safepoint(&self) -> Result<(), Unwind> {
        self.manager.safepoints().poll(self, PollSite::Running)
    }

    /// Yield the native thread, then poll.
    pub fn pass(&self) -> Result<(), Unwind> {
        thread::yield_now();
        self.safepoint()
    }

    pub fn run_until_result<A: BlockingAction>(&self, action: A) -> Result<A::Output, Unwind> {
        self.manager.run_until_result(self, action)
    }

    /// Wait for `target` to finish, re-raising its failure if it has one.
    pub fn join(&self, target: &Arc<GuestThread>) -> Result<Arc<GuestThread>, Unwind> {
        self.check_join_target(target)?;
        let finished = target.completion().clone();
        self.run_until_result(|native: &NativeThread| finished.wait(native, None))?;
        target.reraise()?;
        Ok(target.clone())
    }

    /// Wait at most `timeout` for `target` to finish.
    ///
    /// Returns false if the deadline passed first. Once joined, a stored
    /// failure is re-raised.
    pub fn join_timeout(&self, target: &Arc<GuestThread>, timeout: Duration) -> Result<bool, Unwind> {
        self.check_join_target(target)?;
        let finished = target.completion().clone();
        let start = Instant::now();
        // A deadline too far out to represent means waiting forever.
        let deadline = start.checked_add(timeout);

        let joined = self.run_until_result(|native: &NativeThread| {
            let Some(deadline) = deadline else {
                return finished.wait(native, None);
            };
            if start.elapsed() >= timeout {
                return Ok(finished.is_fired());
            }
            finished.wait(native, Some(deadline))
        })?;

        if !joined {
            self.manager.metrics().record_join_timeout();
            return Ok(false);
        }
        target.reraise()?;
        Ok(true)
    }

    /// `join` with an optional limit; `None` from a timed-out join.
    pub fn join_for(
        &self,
        target: &Arc<GuestThread>,
        timeout: Option<Duration>,
    ) -> Result<Option<Arc<GuestThread>>, Unwind> {
        match timeout {
            None => self.join(target).map(Some),
            Some(timeout) => {
                let joined = self.join_timeout(target, timeout)?;
                Ok(joined.then(|| target.clone()))
            }
        }
    }

    /// Join `target` and return its task's result.
    pub fn value(&self, target: &Arc<GuestThread>) -> Result<Value, Unwind> {
        self.join(target)?;
        Ok(target.value().unwrap_or_default())
    }

    fn check_join_target(&self, target: &Arc<GuestThread>) -> Result<(), ThreadError> {
        if Arc::ptr_eq(target, &self.thread) {
            return Err(ThreadError::JoinCurrent);
        }
        Ok(())
    }

    /// Sleep for `duration`, or until woken when `None`.
    ///
    /// Returns early on [`wakeup`](Self::wakeup). Other interrupts are served
    /// and the sleep resumes with whatever is left of `duration`. Returns the
    /// time actually slept.
    pub fn sleep(&self, duration: Option<Duration>) -> Result<Duration, Unwind> {
        let start = Instant::now();
        let deadline = duration.and_then(|d| start.checked_add(d));
        let thread = &self.thread;

        self.run_until_result(|native: &NativeThread| {
            if thread.should_wake_up() {
                return Ok(());
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => Ok(()),
                deadline => native.park(deadline),
            }
        })?;
        Ok(start.elapsed())
    }

    pub fn wakeup(&self, target: &GuestThread) -> Result<(), ThreadError> {
        self.manager.wakeup(target)
    }

    /// Kill `target`. Killing the current thread unwinds right away unless
    /// the interrupt mode defers it.
    pub fn kill(&self, target: &Arc<GuestThread>) -> Result<bool, Unwind> {
        let scheduled = self.manager.kill(target);
        if Arc::ptr_eq(target, &self.thread) {
            self.safepoint()?;
        }
        Ok(scheduled)
    }

    /// Run `body` with `mode` installed, restoring the previous mode however
    /// `body` exits. Actions deferred by `mode` run once it is lifted.
    pub fn handle_interrupt<T>(
        &self,
        mode: InterruptMode,
        body: impl FnOnce(&Self) -> Result<T, Unwind>,
    ) -> Result<T, Unwind> {
        let result = {
            let _mode = self.thread.override_interrupt_mode(mode);
            body(self)
        };
        let value = result?;
        self.safepoint()?;
        Ok(value)
    }

    /// Take `mutex`, blocking interruptibly while another thread holds it.
    pub fn lock(&self, mutex: &Arc<GuestMutex>) -> Result<(), Unwind> {
        let id = self.thread.id();
        if !mutex.try_enter(id)? {
            let start = Instant::now();
            self.run_until_result(|native: &NativeThread| mutex.enter_interruptibly(id, native, None))?;
            self.manager.metrics().record_lock_contention(start.elapsed());
        }
        self.thread.acquired_lock(mutex.clone());
        Ok(())
    }

    pub fn try_lock(&self, mutex: &Arc<GuestMutex>) -> Result<bool, Unwind> {
        let locked = mutex.try_enter(self.thread.id())?;
        if locked {
            self.thread.acquired_lock(mutex.clone());
        }
        Ok(locked)
    }

    pub fn unlock(&self, mutex: &Arc<GuestMutex>) -> Result<(), Unwind> {
        mutex.exit(self.thread.id())?;
        self.thread.released_lock(mutex);
        Ok(())
    }

    /// Run `body` holding `mutex`. The mutex is released on every exit path.
    pub fn synchronize<T>(
        &self,
        mutex: &Arc<GuestMutex>,
        body: impl FnOnce(&Self) -> Result<T, Unwind>,
    ) -> Result<T, Unwind> {
        self.lock(mutex)?;
        let result = body(self);
        let unlocked = self.unlock(mutex);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    pub fn spawn<F>(&self, info: &str, task: F) -> Result<Arc<GuestThread>, ThreadError>
    where
        F: FnOnce(&ThreadContext) -> Result<Value, Unwind> + Send + 'static,
    {
        self.manager.spawn(info, task)
    }
}
