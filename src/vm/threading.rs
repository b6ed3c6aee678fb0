use crate::{
    error::ThreadError,
    utils::{
        panic_message,
        sync::{get_current_thread_id, set_current_thread_id, Arc, AtomicBool, Mutex, Ordering},
    },
    value::{ExceptionKind, GuestException, Unwind, Value},
    vm::{
        blocking::BlockingAction,
        config::RuntimeConfig,
        context::ThreadContext,
        interrupt::{Interrupted, NativeThread},
        metrics::RuntimeMetrics,
        registry::ThreadRegistry,
        safepoint::{PollSite, SafepointCoordinator},
        thread::{GuestThread, ThreadStatus},
    },
};
use std::{
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::Instant,
};
use tracing::{debug, trace, warn};

/// Manages the lifecycle of guest threads.
///
/// This manager provides:
/// - Thread creation, registration and tracking
/// - The blocking retry loop every interruptible wait goes through
/// - Cross-thread kill and wakeup, delivered through the [`SafepointCoordinator`]
/// - Runtime teardown
///
/// # Thread Safety
///
/// The ThreadManager is designed to be shared via `Arc` across threads. All internal state
/// uses atomic operations, `dashmap` or `parking_lot` synchronization primitives.
///
/// # Thread lifecycle
///
/// 1. [`spawn`](Self::spawn) starts a native thread and waits until it has run `start()`,
///    which binds the native handle, registers the thread and sets it to RUN
/// 2. The task runs on the thread's root fiber; its result, failure or kill unwind is captured
/// 3. `cleanup()` unregisters the thread, force-releases its locks, drops pending safepoint
///    actions and fires the completion signal, exactly once
///
/// The thread that constructs the manager becomes the root thread.
pub struct ThreadManager {
    registry: Arc<ThreadRegistry>,
    safepoints: SafepointCoordinator,
    metrics: Arc<RuntimeMetrics>,
    config: RuntimeConfig,
    root: Arc<GuestThread>,
    /// Native handles of spawned threads, joined at teardown
    native_handles: Mutex<Vec<(Arc<GuestThread>, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

impl ThreadManager {
    /// Create a runtime and bind the calling native thread as its root thread.
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        let registry = Arc::new(ThreadRegistry::new());
        let metrics = Arc::new(RuntimeMetrics::new());
        let root = Arc::new(GuestThread::new(config.root_thread_name.clone()));
        let manager = Arc::new(Self {
            safepoints: SafepointCoordinator::new(registry.clone(), metrics.clone()),
            registry,
            metrics,
            config,
            root,
            native_handles: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        });
        manager.start(&manager.root);
        manager
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn safepoints(&self) -> &SafepointCoordinator {
        &self.safepoints
    }

    pub fn root_thread(&self) -> &Arc<GuestThread> {
        &self.root
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Get the guest thread bound to the calling native thread.
    /// Returns None if the thread is not registered with this runtime.
    pub fn current_thread(&self) -> Option<Arc<GuestThread>> {
        // Try thread-local cache first
        if let Some(thread) = get_current_thread_id().and_then(|id| self.registry.get(id)) {
            return Some(thread);
        }

        // Fallback to the native id index
        let thread = self.registry.find_by_native(thread::current().id())?;
        set_current_thread_id(Some(thread.id()));
        Some(thread)
    }

    /// Build the execution context of the calling native thread.
    pub fn current_context(self: &Arc<Self>) -> Result<ThreadContext, ThreadError> {
        let thread = self.current_thread().ok_or(ThreadError::NotRegistered)?;
        let native = thread.native_thread().ok_or(ThreadError::NotRegistered)?;
        Ok(ThreadContext::new(self.clone(), thread, native))
    }

    /// Every live guest thread, ordered by id.
    pub fn list(&self) -> Vec<Arc<GuestThread>> {
        self.registry.snapshot()
    }

    /// Get the number of currently registered threads.
    pub fn thread_count(&self) -> usize {
        self.registry.len()
    }

    /// Bind `thread` to the calling native thread, register it and mark it
    /// running.
    pub fn start(&self, thread: &Arc<GuestThread>) -> Arc<NativeThread> {
        let native = NativeThread::current();
        thread.bind_native(Some(native.clone()));
        thread.set_status(ThreadStatus::Run);
        self.registry.register(thread.clone(), native.id());
        set_current_thread_id(Some(thread.id()));
        self.metrics.record_thread_started();
        debug!(thread = thread.id(), name = %thread.name(), "guest thread started");
        native
    }

    /// Tear down a terminated thread. Only the first call has any effect.
    pub fn cleanup(&self, thread: &GuestThread) {
        if !thread.begin_cleanup() {
            return;
        }
        thread.set_status(ThreadStatus::Aborting);
        self.registry.unregister(thread);
        if get_current_thread_id() == Some(thread.id()) {
            set_current_thread_id(None);
        }
        thread.set_status(ThreadStatus::Dead);
        thread.bind_native(None);

        let released = thread.release_owned_locks();
        let discarded = self.safepoints.discard_pending(thread);
        thread.completion().fire();
        debug!(
            thread = thread.id(),
            released_locks = released,
            discarded_actions = discarded,
            "guest thread cleaned up"
        );
    }

    /// Shut down the thread's fibers and produce the unwind that carries the
    /// thread out of its task. Must run on the thread itself.
    pub fn shutdown_thread(&self, thread: &GuestThread) -> Unwind {
        debug!(thread = thread.id(), "shutting down guest thread");
        thread.fiber_manager().shutdown();
        Unwind::ThreadExit
    }

    /// Run `task` on a new guest thread named `"{prefix}@{info}"`.
    ///
    /// Returns once the new thread has been started and registered.
    pub fn spawn<F>(self: &Arc<Self>, info: &str, task: F) -> Result<Arc<GuestThread>, ThreadError>
    where
        F: FnOnce(&ThreadContext) -> Result<Value, Unwind> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(ThreadError::ShutDown);
        }

        let name = self.config.thread_name(info);
        let thread = Arc::new(GuestThread::new(name.clone()));
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let manager = self.clone();
        let guest = thread.clone();
        let handle = builder.spawn(move || {
            let native = manager.start(&guest);
            let _ = started_tx.send(());
            manager.run(guest, native, task);
        })?;

        // The sender is dropped if the thread dies before starting.
        let _ = started_rx.recv();

        {
            let mut handles = self.native_handles.lock();
            handles.retain(|(_, handle)| !handle.is_finished());
            handles.push((thread.clone(), handle));
        }

        // Teardown may have snapshotted the registry before this thread registered.
        if self.is_shut_down() {
            self.kill(&thread);
        }
        Ok(thread)
    }

    fn run<F>(self: Arc<Self>, thread: Arc<GuestThread>, native: Arc<NativeThread>, task: F)
    where
        F: FnOnce(&ThreadContext) -> Result<Value, Unwind>,
    {
        let ctx = ThreadContext::new(self.clone(), thread.clone(), native);
        let root = thread.root_fiber();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            thread.fiber_manager().run(&root, || task(&ctx))
        }));
        drop(ctx);

        match result {
            Ok(Ok(value)) => thread.set_value(value),
            Ok(Err(Unwind::ThreadExit)) => {
                self.metrics.record_thread_killed();
                thread.set_value(Value::Nil);
            }
            Ok(Err(Unwind::Raise(failure))) => {
                self.metrics.record_thread_failed();
                debug!(
                    thread = thread.id(),
                    abort_on_exception = thread.abort_on_exception(),
                    "guest thread terminated by {}",
                    failure
                );
                thread.set_failure(failure);
            }
            Ok(Err(Unwind::Return(_))) => {
                self.metrics.record_thread_failed();
                thread.set_failure(Arc::new(GuestException::unexpected_return()));
            }
            Err(payload) => {
                self.metrics.record_thread_failed();
                let message = panic_message(payload.as_ref());
                warn!(thread = thread.id(), "guest thread panicked: {}", message);
                thread.set_failure(Arc::new(GuestException::new(ExceptionKind::Fatal, message)));
            }
        }

        self.metrics.record_thread_finished();
        self.cleanup(&thread);
    }

    /// Drive `action` until it produces a result.
    ///
    /// The thread is marked SLEEP for the duration. Every interrupted attempt
    /// serves the thread's pending safepoint actions before the next attempt,
    /// so a kill delivered during the wait unwinds out of here.
    pub fn run_until_result<A>(&self, ctx: &ThreadContext, mut action: A) -> Result<A::Output, Unwind>
    where
        A: BlockingAction,
    {
        let _sleeping = BlockingScope::enter(ctx.thread());
        loop {
            match action.block(ctx.native()) {
                Ok(output) => return Ok(output),
                Err(Interrupted) => {
                    self.metrics.record_blocking_interruption();
                    trace!(thread = ctx.thread().id(), "blocking attempt interrupted");
                    self.safepoints.poll(ctx, PollSite::Blocking)?;
                }
            }
        }
    }

    /// Ask `thread` to terminate at its next allowed poll point.
    ///
    /// Returns immediately; the thread is only known to be dead once its
    /// completion signal has been observed. Returns false, without error, if
    /// the thread is already terminating or dead.
    pub fn kill(&self, thread: &GuestThread) -> bool {
        if !thread.is_alive() {
            return false;
        }
        let Some(native) = thread.native_thread() else {
            return false;
        };
        let scheduled = self
            .safepoints
            .pause_thread_and_execute_later(&native, |ctx| {
                Err(ctx.manager().shutdown_thread(ctx.thread()))
            });
        debug!(thread = thread.id(), scheduled, "kill requested");
        scheduled
    }

    /// Wake `thread` out of a sleep or blocking wait.
    pub fn wakeup(&self, thread: &GuestThread) -> Result<(), ThreadError> {
        if thread.status() == ThreadStatus::Dead {
            return Err(ThreadError::Killed);
        }
        thread.request_wakeup();
        Ok(())
    }

    /// Kill every other thread, wait for them up to the configured grace
    /// period, then clean up the root thread. Further spawns fail.
    ///
    /// Must be called on the root thread. Calling it again after teardown
    /// has started is a no-op.
    ///
    /// The wait for killed threads is the one wait that does not go through
    /// [`run_until_result`](Self::run_until_result): the root's own work has
    /// ended by the time it tears the runtime down, so nothing is left to
    /// deliver to it, and a kill aimed at the root must not cut teardown short.
    pub fn shutdown(&self) -> Result<(), ThreadError> {
        if self.is_shut_down() {
            return Ok(());
        }
        let on_root = self
            .current_thread()
            .is_some_and(|current| Arc::ptr_eq(&current, &self.root));
        if !on_root {
            return Err(ThreadError::NotRootThread);
        }
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let victims: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|t| !Arc::ptr_eq(t, &self.root))
            .collect();
        debug!(threads = victims.len(), "shutting down runtime");

        for thread in &victims {
            self.kill(thread);
        }

        let start_time = Instant::now();
        let deadline = start_time + self.config.shutdown_grace;
        let stuck: Vec<_> = victims
            .iter()
            .filter(|t| !t.completion().wait_uninterruptibly(deadline))
            .collect();

        if !stuck.is_empty() {
            warn!(
                "Runtime teardown taking longer than expected: {} of {} threads still alive after {} ms",
                stuck.len(),
                victims.len(),
                start_time.elapsed().as_millis()
            );
            for thread in &stuck {
                warn!(
                    "  - Thread ID {} ({}): {:?}, interrupt mode {:?}",
                    thread.id(),
                    thread.name(),
                    thread.status(),
                    thread.interrupt_mode()
                );
            }
        }

        let handles = std::mem::take(&mut *self.native_handles.lock());
        for (thread, handle) in handles {
            // Threads still running are detached.
            if thread.is_finished() {
                let _ = handle.join();
            }
        }

        self.cleanup(&self.root);
        Ok(())
    }
}

/// Marks a thread SLEEP for the extent of a blocking wait.
struct BlockingScope<'a> {
    thread: &'a GuestThread,
    entered: bool,
}

impl<'a> BlockingScope<'a> {
    fn enter(thread: &'a GuestThread) -> Self {
        let entered = thread.transition(ThreadStatus::Run, ThreadStatus::Sleep);
        Self { thread, entered }
    }
}

impl Drop for BlockingScope<'_> {
    fn drop(&mut self) {
        if self.entered {
            self.thread.transition(ThreadStatus::Sleep, ThreadStatus::Run);
        }
    }
}
