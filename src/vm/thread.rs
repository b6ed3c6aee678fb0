use crate::{
    error::ThreadError,
    utils::sync::{
        get_current_thread_id, Arc, AtomicBool, AtomicU64, AtomicU8, Mutex, Ordering, RwLock,
    },
    value::{GuestException, Unwind, Value},
    vm::{
        fiber::{Fiber, FiberManager},
        interrupt::NativeThread,
        locks::GuestMutex,
        safepoint::{PollSite, SafepointAction},
        signal::CompletionSignal,
    },
};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use std::{fmt, str::FromStr, thread::ThreadId};

/// Global counter for allocating managed thread IDs across all thread managers.
/// Keeps ids unique when several runtimes live in one process.
static NEXT_GLOBAL_THREAD_ID: AtomicU64 = AtomicU64::new(1); // Thread ID 0 is reserved

/// Represents the state of a guest thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Executing or runnable
    Run = 0,
    /// Blocked in a cooperative wait
    Sleep = 1,
    /// Terminal unwind in progress
    Aborting = 2,
    /// Terminated, completion signal fired
    Dead = 3,
}

impl ThreadStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadStatus::Run,
            1 => ThreadStatus::Sleep,
            2 => ThreadStatus::Aborting,
            _ => ThreadStatus::Dead,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThreadStatus::Run => "run",
            ThreadStatus::Sleep => "sleep",
            ThreadStatus::Aborting => "aborting",
            ThreadStatus::Dead => "dead",
        }
    }
}

/// When asynchronous safepoint actions may take effect against a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum InterruptMode {
    /// At any poll point
    #[default]
    Immediate = 0,
    /// Only at poll points reached while blocked
    OnBlocking = 1,
    /// Deferred until the mode changes
    Never = 2,
}

impl InterruptMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => InterruptMode::Immediate,
            1 => InterruptMode::OnBlocking,
            _ => InterruptMode::Never,
        }
    }

    /// Whether pending actions may run at a poll point of the given kind.
    pub fn allows(self, site: PollSite) -> bool {
        match self {
            InterruptMode::Immediate => true,
            InterruptMode::OnBlocking => site == PollSite::Blocking,
            InterruptMode::Never => false,
        }
    }
}

impl FromStr for InterruptMode {
    type Err = ThreadError;

    fn from_str(timing: &str) -> Result<Self, Self::Err> {
        match timing {
            "immediate" => Ok(InterruptMode::Immediate),
            "on_blocking" => Ok(InterruptMode::OnBlocking),
            "never" => Ok(InterruptMode::Never),
            other => Err(ThreadError::InvalidTiming(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Value(Value),
    Failed(Arc<GuestException>),
}

/// One runtime-visible thread.
///
/// Apart from the pending-action queue, `status` and the wakeup flag are the
/// only fields other threads write. The rest belong to the thread's own
/// execution, including safepoint actions, which always run on the thread
/// itself.
pub struct GuestThread {
    id: u64,
    name: RwLock<String>,
    status: AtomicU8,
    native: Mutex<Option<Arc<NativeThread>>>,
    fibers: FiberManager,
    finished: Arc<CompletionSignal>,
    outcome: Mutex<Option<Outcome>>,
    wakeup_requested: AtomicBool,
    interrupt_mode: AtomicU8,
    abort_on_exception: AtomicBool,
    owned_locks: Mutex<Vec<Arc<GuestMutex>>>,
    locals: DashMap<String, Value>,
    actions_tx: Sender<SafepointAction>,
    actions_rx: Receiver<SafepointAction>,
    /// Cleared once cleanup has drained the queue; guards every send.
    accepting_actions: Mutex<bool>,
    cleaned_up: AtomicBool,
}

impl GuestThread {
    pub(crate) fn new(name: String) -> Self {
        let (actions_tx, actions_rx) = crossbeam_channel::unbounded();
        Self {
            id: NEXT_GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            fibers: FiberManager::new(&name),
            name: RwLock::new(name),
            status: AtomicU8::new(ThreadStatus::Run as u8),
            native: Mutex::new(None),
            finished: Arc::new(CompletionSignal::new()),
            outcome: Mutex::new(None),
            wakeup_requested: AtomicBool::new(false),
            interrupt_mode: AtomicU8::new(InterruptMode::Immediate as u8),
            abort_on_exception: AtomicBool::new(false),
            owned_locks: Mutex::new(Vec::new()),
            locals: DashMap::new(),
            actions_tx,
            actions_rx,
            accepting_actions: Mutex::new(true),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Managed thread id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn transition(&self, from: ThreadStatus, to: ThreadStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.status(), ThreadStatus::Aborting | ThreadStatus::Dead)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.status(), ThreadStatus::Dead | ThreadStatus::Sleep)
    }

    /// Status in the guest's convention: a status string while alive or
    /// aborting; once dead, `false` after a normal finish and `nil` when a
    /// failure is stored.
    pub fn status_value(&self) -> Value {
        match self.status() {
            ThreadStatus::Dead => {
                if self.failure().is_some() {
                    Value::Nil
                } else {
                    Value::Bool(false)
                }
            }
            status => Value::from(status.as_str()),
        }
    }

    pub fn native_thread(&self) -> Option<Arc<NativeThread>> {
        self.native.lock().clone()
    }

    pub(crate) fn bind_native(&self, native: Option<Arc<NativeThread>>) {
        *self.native.lock() = native;
    }

    pub fn fiber_manager(&self) -> &FiberManager {
        &self.fibers
    }

    pub fn root_fiber(&self) -> Arc<Fiber> {
        self.fibers.root_fiber()
    }

    /// Native thread the current fiber last ran on.
    pub fn current_fiber_native_id(&self) -> Option<ThreadId> {
        self.fibers.current_fiber().native_id()
    }

    pub fn completion(&self) -> &Arc<CompletionSignal> {
        &self.finished
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_fired()
    }

    pub(crate) fn set_value(&self, value: Value) {
        *self.outcome.lock() = Some(Outcome::Value(value));
    }

    pub(crate) fn set_failure(&self, failure: Arc<GuestException>) {
        *self.outcome.lock() = Some(Outcome::Failed(failure));
    }

    /// The task's result, once it has finished without a failure.
    pub fn value(&self) -> Option<Value> {
        match &*self.outcome.lock() {
            Some(Outcome::Value(v)) => Some(v.clone()),
            _ => None,
        }
    }

    /// The failure captured from the task, if it raised.
    pub fn failure(&self) -> Option<Arc<GuestException>> {
        match &*self.outcome.lock() {
            Some(Outcome::Failed(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Re-raise the stored failure, if any. Every call raises the same object.
    pub(crate) fn reraise(&self) -> Result<(), Unwind> {
        match self.failure() {
            Some(failure) => Err(Unwind::Raise(failure)),
            None => Ok(()),
        }
    }

    /// Set the wakeup flag and break the native thread out of any blocking
    /// call it is in.
    pub(crate) fn request_wakeup(&self) {
        self.wakeup_requested.store(true, Ordering::SeqCst);
        if let Some(native) = self.native_thread() {
            native.interrupt();
        }
    }

    /// Whether a wakeup was requested, clearing the request.
    pub fn should_wake_up(&self) -> bool {
        self.wakeup_requested.swap(false, Ordering::SeqCst)
    }

    pub fn is_wakeup_requested(&self) -> bool {
        self.wakeup_requested.load(Ordering::SeqCst)
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        InterruptMode::from_u8(self.interrupt_mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_interrupt_mode(&self, mode: InterruptMode) {
        self.interrupt_mode.store(mode as u8, Ordering::Release);
    }

    /// Install `mode` until the returned guard is dropped.
    pub fn override_interrupt_mode(&self, mode: InterruptMode) -> InterruptModeGuard<'_> {
        let previous = self.interrupt_mode();
        self.set_interrupt_mode(mode);
        InterruptModeGuard {
            thread: self,
            previous,
        }
    }

    pub fn abort_on_exception(&self) -> bool {
        self.abort_on_exception.load(Ordering::Relaxed)
    }

    pub fn set_abort_on_exception(&self, abort_on_exception: bool) {
        self.abort_on_exception
            .store(abort_on_exception, Ordering::Relaxed);
    }

    /// Record a lock taken by this thread. Must be called from the thread's
    /// own execution.
    pub fn acquired_lock(&self, lock: Arc<GuestMutex>) {
        debug_assert_eq!(get_current_thread_id(), Some(self.id));
        self.owned_locks.lock().push(lock);
    }

    /// Forget a lock this thread released. Must be called from the thread's
    /// own execution.
    pub fn released_lock(&self, lock: &Arc<GuestMutex>) {
        debug_assert_eq!(get_current_thread_id(), Some(self.id));
        let mut owned = self.owned_locks.lock();
        // TODO: linear in the number of held locks; index by mutex id if
        // threads start holding many.
        if let Some(index) = owned.iter().position(|l| Arc::ptr_eq(l, lock)) {
            owned.swap_remove(index);
        }
    }

    /// Unlock everything this thread still holds. Returns how many locks were
    /// released.
    pub(crate) fn release_owned_locks(&self) -> usize {
        let owned: Vec<_> = self.owned_locks.lock().drain(..).collect();
        owned
            .iter()
            .filter(|lock| lock.force_unlock(self.id))
            .count()
    }

    pub fn owned_lock_count(&self) -> usize {
        self.owned_locks.lock().len()
    }

    /// Read a thread-local variable.
    pub fn local(&self, key: &str) -> Option<Value> {
        self.locals.get(key).map(|v| v.clone())
    }

    pub fn set_local(&self, key: impl Into<String>, value: Value) {
        self.locals.insert(key.into(), value);
    }

    /// Queue an action for the thread's next poll. Returns false, dropping
    /// the action, once the queue has been closed by cleanup.
    pub(crate) fn enqueue_action(&self, action: SafepointAction) -> bool {
        let accepting = self.accepting_actions.lock();
        if !*accepting {
            return false;
        }
        // The receiver lives as long as the thread, so this cannot fail.
        self.actions_tx.send(action).is_ok()
    }

    /// Stop accepting actions and drop the ones still queued.
    pub(crate) fn close_actions(&self) -> usize {
        let mut accepting = self.accepting_actions.lock();
        *accepting = false;
        let mut discarded = 0;
        while self.actions_rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    pub(crate) fn next_action(&self) -> Option<SafepointAction> {
        self.actions_rx.try_recv().ok()
    }

    pub fn pending_action_count(&self) -> usize {
        self.actions_rx.len()
    }

    /// Returns true the first time cleanup is entered.
    pub(crate) fn begin_cleanup(&self) -> bool {
        !self.cleaned_up.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for GuestThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestThread")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("status", &self.status())
            .field("interrupt_mode", &self.interrupt_mode())
            .finish_non_exhaustive()
    }
}

/// Restores a thread's previous interrupt mode when dropped, including during
/// unwinding.
#[must_use = "the previous interrupt mode is restored when the guard is dropped"]
pub struct InterruptModeGuard<'a> {
    thread: &'a GuestThread,
    previous: InterruptMode,
}

impl InterruptModeGuard<'_> {
    pub fn previous(&self) -> InterruptMode {
        self.previous
    }
}

impl Drop for InterruptModeGuard<'_> {
    fn drop(&mut self) {
        self.thread.set_interrupt_mode(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ExceptionKind;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    const ALL_STATUSES: [ThreadStatus; 4] = [
        ThreadStatus::Run,
        ThreadStatus::Sleep,
        ThreadStatus::Aborting,
        ThreadStatus::Dead,
    ];

    #[test]
    fn test_alive_and_stopped_across_states() {
        let thread = GuestThread::new("t".into());
        for status in ALL_STATUSES {
            thread.set_status(status);
            let alive = !matches!(status, ThreadStatus::Aborting | ThreadStatus::Dead);
            let stopped = matches!(status, ThreadStatus::Dead | ThreadStatus::Sleep);
            assert_eq!(thread.is_alive(), alive, "alive? in {:?}", status);
            assert_eq!(thread.is_stopped(), stopped, "stop? in {:?}", status);
        }
    }

    #[test]
    fn test_status_value() {
        let thread = GuestThread::new("t".into());
        assert_eq!(thread.status_value(), Value::from("run"));
        thread.set_status(ThreadStatus::Sleep);
        assert_eq!(thread.status_value(), Value::from("sleep"));

        thread.set_status(ThreadStatus::Dead);
        thread.set_value(Value::from(1));
        assert_eq!(thread.status_value(), Value::Bool(false));

        thread.set_failure(Arc::new(GuestException::runtime_error("boom")));
        assert_eq!(thread.status_value(), Value::Nil);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let thread = GuestThread::new("t".into());
        assert!(thread.transition(ThreadStatus::Run, ThreadStatus::Sleep));
        assert!(!thread.transition(ThreadStatus::Run, ThreadStatus::Sleep));
        assert!(thread.transition(ThreadStatus::Sleep, ThreadStatus::Run));
        thread.set_status(ThreadStatus::Aborting);
        assert!(!thread.transition(ThreadStatus::Run, ThreadStatus::Sleep));
    }

    #[test]
    fn test_should_wake_up_clears_flag() {
        let thread = GuestThread::new("t".into());
        assert!(!thread.should_wake_up());
        thread.request_wakeup();
        assert!(thread.is_wakeup_requested());
        assert!(thread.should_wake_up());
        assert!(!thread.should_wake_up());
    }

    #[test]
    fn test_wakeup_interrupts_bound_native() {
        let thread = GuestThread::new("t".into());
        let native = NativeThread::current();
        thread.bind_native(Some(native.clone()));
        thread.request_wakeup();
        assert!(native.is_interrupted());
    }

    #[test]
    fn test_interrupt_mode_guard_restores() {
        let thread = GuestThread::new("t".into());
        {
            let guard = thread.override_interrupt_mode(InterruptMode::Never);
            assert_eq!(guard.previous(), InterruptMode::Immediate);
            assert_eq!(thread.interrupt_mode(), InterruptMode::Never);
            {
                let _inner = thread.override_interrupt_mode(InterruptMode::OnBlocking);
                assert_eq!(thread.interrupt_mode(), InterruptMode::OnBlocking);
            }
            assert_eq!(thread.interrupt_mode(), InterruptMode::Never);
        }
        assert_eq!(thread.interrupt_mode(), InterruptMode::Immediate);
    }

    #[test]
    fn test_interrupt_mode_guard_restores_on_panic() {
        let thread = GuestThread::new("t".into());
        let result = catch_unwind(AssertUnwindSafe(|| {
            let _guard = thread.override_interrupt_mode(InterruptMode::Never);
            panic!("body failed");
        }));
        assert!(result.is_err());
        assert_eq!(thread.interrupt_mode(), InterruptMode::Immediate);
    }

    #[test]
    fn test_interrupt_mode_parsing() {
        assert_eq!("immediate".parse::<InterruptMode>().unwrap(), InterruptMode::Immediate);
        assert_eq!("on_blocking".parse::<InterruptMode>().unwrap(), InterruptMode::OnBlocking);
        assert_eq!("never".parse::<InterruptMode>().unwrap(), InterruptMode::Never);
        let err = "later".parse::<InterruptMode>().unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::ArgumentError);
    }

    #[test]
    fn test_interrupt_mode_allows() {
        assert!(InterruptMode::Immediate.allows(PollSite::Running));
        assert!(InterruptMode::Immediate.allows(PollSite::Blocking));
        assert!(!InterruptMode::OnBlocking.allows(PollSite::Running));
        assert!(InterruptMode::OnBlocking.allows(PollSite::Blocking));
        assert!(!InterruptMode::Never.allows(PollSite::Running));
        assert!(!InterruptMode::Never.allows(PollSite::Blocking));
    }

    #[test]
    fn test_failure_is_shared() {
        let thread = GuestThread::new("t".into());
        thread.set_failure(Arc::new(GuestException::runtime_error("boom")));
        let first = thread.reraise().unwrap_err();
        let second = thread.reraise().unwrap_err();
        assert!(Arc::ptr_eq(
            first.exception().unwrap(),
            second.exception().unwrap()
        ));
        assert!(thread.value().is_none());
    }

    #[test]
    fn test_thread_locals() {
        let thread = GuestThread::new("t".into());
        assert!(thread.local("k").is_none());
        thread.set_local("k", Value::from(3));
        assert_eq!(thread.local("k"), Some(Value::from(3)));
    }

    #[test]
    fn test_name_and_abort_on_exception() {
        let thread = GuestThread::new("t".into());
        assert_eq!(thread.name(), "t");
        thread.set_name("renamed");
        assert_eq!(thread.name(), "renamed");

        assert!(!thread.abort_on_exception());
        thread.set_abort_on_exception(true);
        assert!(thread.abort_on_exception());
        thread.set_abort_on_exception(false);
        assert!(!thread.abort_on_exception());
    }

    #[test]
    fn test_closed_action_queue_rejects_actions() {
        let thread = GuestThread::new("t".into());
        assert!(thread.enqueue_action(Box::new(|_| Ok(()))));
        assert!(thread.enqueue_action(Box::new(|_| Ok(()))));
        assert_eq!(thread.close_actions(), 2);

        assert!(!thread.enqueue_action(Box::new(|_| Ok(()))));
        assert_eq!(thread.pending_action_count(), 0);
        assert!(thread.next_action().is_none());
        assert_eq!(thread.close_actions(), 0);
    }

    #[test]
    fn test_release_owned_locks() {
        let thread = GuestThread::new("t".into());
        crate::utils::sync::set_current_thread_id(Some(thread.id()));
        let locks: Vec<_> = (0..3).map(|_| Arc::new(GuestMutex::new())).collect();
        for lock in &locks {
            assert!(lock.try_enter(thread.id()).unwrap());
            thread.acquired_lock(lock.clone());
        }
        thread.released_lock(&locks[1]);
        locks[1].exit(thread.id()).unwrap();

        assert_eq!(thread.release_owned_locks(), 2);
        assert_eq!(thread.owned_lock_count(), 0);
        assert!(locks.iter().all(|l| !l.is_locked()));
        crate::utils::sync::set_current_thread_id(None);
    }
}
