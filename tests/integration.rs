use guest_threads::{
    error::ThreadError,
    utils::sync::{Arc, AtomicBool, Ordering},
    value::{ExceptionKind, GuestException, Unwind, Value},
    vm::{GuestMutex, InterruptMode, RuntimeConfig, ThreadContext, ThreadManager, ThreadStatus},
};
use std::time::{Duration, Instant};

pub struct TestHarness {
    pub manager: Arc<ThreadManager>,
    pub ctx: ThreadContext,
}

impl TestHarness {
    pub fn new() -> Self {
        let manager = ThreadManager::new(RuntimeConfig::default().with_shutdown_grace(Duration::from_secs(2)));
        let ctx = manager.current_context().unwrap();
        Self { manager, ctx }
    }

    /// Wait (uninterruptibly) until `predicate` holds, failing the test after a second.
    pub fn wait_until(&self, mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(1);
        while !predicate() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = self.manager.shutdown();
    }
}

#[test]
fn test_join_returns_value() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("answer", |ctx| {
            ctx.sleep(Some(Duration::from_millis(50)))?;
            Ok(Value::from(42))
        })
        .unwrap();

    let joined = h.ctx.join(&thread).unwrap();
    assert!(Arc::ptr_eq(&joined, &thread));
    assert_eq!(h.ctx.value(&thread).unwrap(), Value::from(42));
    assert_eq!(thread.status(), ThreadStatus::Dead);
    assert_eq!(thread.status_value(), Value::Bool(false));
    assert!(!thread.is_alive());
    assert!(thread.is_stopped());
}

#[test]
fn test_failure_reraised_on_every_join() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("boom", |_| Err(GuestException::runtime_error("boom").into()))
        .unwrap();

    let first = h.ctx.join(&thread).unwrap_err();
    let second = h.ctx.join(&thread).unwrap_err();
    let third = h.ctx.value(&thread).unwrap_err();

    let first = first.exception().unwrap();
    assert_eq!(first.message(), "boom");
    assert_eq!(first.kind(), ExceptionKind::RuntimeError);
    assert!(Arc::ptr_eq(first, second.exception().unwrap()));
    assert!(Arc::ptr_eq(first, third.exception().unwrap()));
    assert_eq!(thread.status_value(), Value::Nil);
}

#[test]
fn test_abort_on_exception_readable_after_failure() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("supervised", |ctx| {
            ctx.thread().set_name("supervised-renamed");
            ctx.thread().set_abort_on_exception(true);
            Err(GuestException::runtime_error("supervised failure").into())
        })
        .unwrap();

    assert!(h.ctx.join(&thread).is_err());
    assert_eq!(thread.status(), ThreadStatus::Dead);
    assert_eq!(thread.name(), "supervised-renamed");
    assert!(thread.abort_on_exception());
    let failure = thread.failure().unwrap();
    assert_eq!(failure.message(), "supervised failure");
    assert_eq!(failure.kind(), ExceptionKind::RuntimeError);
}

#[test]
fn test_timed_join() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("slow", |ctx| {
            ctx.sleep(Some(Duration::from_millis(150)))?;
            Ok(Value::from(1))
        })
        .unwrap();

    let start = Instant::now();
    assert!(!h.ctx.join_timeout(&thread, Duration::from_millis(20)).unwrap());
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert!(thread.is_alive());

    assert!(h.ctx.join_timeout(&thread, Duration::from_secs(5)).unwrap());
    assert!(thread.is_finished());
    assert_eq!(thread.value(), Some(Value::from(1)));
}

#[test]
fn test_timed_join_raises_stored_failure() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("fails", |_| Err(GuestException::runtime_error("late").into()))
        .unwrap();
    let err = h.ctx.join_timeout(&thread, Duration::from_secs(5)).unwrap_err();
    assert_eq!(err.exception().unwrap().message(), "late");
}

#[test]
fn test_kill_releases_owned_locks() {
    const LOCKS: usize = 4;
    let h = TestHarness::new();
    let mutexes: Vec<_> = (0..LOCKS).map(|_| Arc::new(GuestMutex::new())).collect();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

    let held = mutexes.clone();
    let thread = h
        .ctx
        .spawn("holder", move |ctx| {
            for mutex in &held {
                ctx.lock(mutex)?;
            }
            let _ = ready_tx.send(ctx.thread().owned_lock_count());
            ctx.sleep(None)?;
            Ok(Value::from("not killed"))
        })
        .unwrap();

    assert_eq!(ready_rx.recv().unwrap(), LOCKS);
    assert!(mutexes.iter().all(|m| m.owner() == Some(thread.id())));

    assert!(h.ctx.kill(&thread).unwrap());
    h.ctx.join(&thread).unwrap();

    assert_eq!(thread.owned_lock_count(), 0);
    assert!(mutexes.iter().all(|m| !m.is_locked()));
    assert_eq!(thread.value(), Some(Value::Nil));
    assert_eq!(h.manager.metrics().threads_killed.load(Ordering::Relaxed), 1);
}

#[test]
fn test_kill_is_idempotent() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("victim", |ctx| {
            ctx.sleep(None)?;
            Ok(Value::Nil)
        })
        .unwrap();

    h.ctx.kill(&thread).unwrap();
    h.ctx.kill(&thread).unwrap();
    h.ctx.join(&thread).unwrap();

    assert!(!h.ctx.kill(&thread).unwrap());
    assert_eq!(thread.status(), ThreadStatus::Dead);
    assert_eq!(thread.pending_action_count(), 0);
}

#[test]
fn test_kill_deferred_while_interrupts_disabled() {
    let h = TestHarness::new();
    let finished_body = Arc::new(AtomicBool::new(false));
    let finished_clone = finished_body.clone();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

    let thread = h
        .ctx
        .spawn("protected", move |ctx| {
            ctx.handle_interrupt(InterruptMode::Never, |ctx| {
                let _ = ready_tx.send(());
                ctx.sleep(Some(Duration::from_millis(60)))?;
                finished_clone.store(true, Ordering::SeqCst);
                Ok(())
            })?;
            Ok(Value::from("survived"))
        })
        .unwrap();

    ready_rx.recv().unwrap();
    h.ctx.kill(&thread).unwrap();
    h.ctx.join(&thread).unwrap();

    assert!(finished_body.load(Ordering::SeqCst));
    assert_eq!(thread.value(), Some(Value::Nil));
}

#[test]
fn test_kill_allowed_on_blocking_when_blocked() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("blocked", |ctx| {
            ctx.handle_interrupt(InterruptMode::OnBlocking, |ctx| ctx.sleep(None))?;
            Ok(Value::from("woke"))
        })
        .unwrap();

    h.wait_until(|| thread.status() == ThreadStatus::Sleep);
    h.ctx.kill(&thread).unwrap();
    h.ctx.join(&thread).unwrap();
    assert_eq!(thread.value(), Some(Value::Nil));
}

#[test]
fn test_wakeup_dead_thread_raises() {
    let h = TestHarness::new();
    let thread = h.ctx.spawn("done", |_| Ok(Value::Nil)).unwrap();
    h.ctx.join(&thread).unwrap();

    let err = h.ctx.wakeup(&thread).unwrap_err();
    assert!(matches!(err, ThreadError::Killed));
    assert_eq!(GuestException::from(err).kind(), ExceptionKind::ThreadError);
}

#[test]
fn test_wakeup_resumes_sleeping_thread() {
    let h = TestHarness::new();
    let thread = h
        .ctx
        .spawn("sleeper", |ctx| {
            let slept = ctx.sleep(None)?;
            Ok(Value::from(slept.as_millis() as i64))
        })
        .unwrap();

    h.wait_until(|| thread.status() == ThreadStatus::Sleep);
    assert!(thread.is_stopped());
    h.ctx.wakeup(&thread).unwrap();

    assert!(h.ctx.join_timeout(&thread, Duration::from_secs(5)).unwrap());
    assert!(thread.value().unwrap().as_integer().is_some());
    assert!(!thread.is_wakeup_requested());
}

#[test]
fn test_interrupt_mode_restored_on_every_exit() {
    let h = TestHarness::new();
    let ok = h
        .ctx
        .handle_interrupt(InterruptMode::Never, |ctx| {
            assert_eq!(ctx.thread().interrupt_mode(), InterruptMode::Never);
            Ok(1)
        })
        .unwrap();
    assert_eq!(ok, 1);
    assert_eq!(h.ctx.thread().interrupt_mode(), InterruptMode::Immediate);

    let err = h
        .ctx
        .handle_interrupt(InterruptMode::OnBlocking, |_| -> Result<(), Unwind> {
            Err(GuestException::runtime_error("raised in block").into())
        })
        .unwrap_err();
    assert_eq!(err.exception().unwrap().message(), "raised in block");
    assert_eq!(h.ctx.thread().interrupt_mode(), InterruptMode::Immediate);
}

#[test]
fn test_pause_all_threads_runs_on_each_thread() {
    let h = TestHarness::new();
    let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
    let threads: Vec<_> = (0..3)
        .map(|i| {
            let ready_tx = ready_tx.clone();
            h.ctx
                .spawn(&format!("pausable-{}", i), move |ctx| {
                    let _ = ready_tx.send(());
                    ctx.sleep(Some(Duration::from_millis(100)))?;
                    Ok(ctx.thread().local("visited").unwrap_or_default())
                })
                .unwrap()
        })
        .collect();
    for _ in 0..3 {
        ready_rx.recv().unwrap();
    }

    let reached = h
        .manager
        .safepoints()
        .pause_all_threads_and_execute_later(|ctx| {
            ctx.thread().set_local("visited", Value::from(ctx.thread().id() as i64));
            Ok(())
        });
    assert_eq!(reached, 4);

    h.ctx.safepoint().unwrap();
    assert_eq!(
        h.ctx.thread().local("visited"),
        Some(Value::from(h.ctx.thread().id() as i64))
    );
    for thread in &threads {
        assert_eq!(
            h.ctx.value(thread).unwrap(),
            Value::from(thread.id() as i64)
        );
    }
}

#[test]
fn test_list_and_current() {
    let h = TestHarness::new();
    let root = h.manager.root_thread().clone();
    let thread = h
        .ctx
        .spawn("lister", move |ctx| {
            let current = ctx.manager().current_thread().unwrap();
            assert!(Arc::ptr_eq(&current, ctx.thread()));
            assert!(!Arc::ptr_eq(&current, &root));
            Ok(Value::from(ctx.manager().list().len() as i64))
        })
        .unwrap();

    assert_eq!(h.ctx.value(&thread).unwrap(), Value::from(2));
    assert_eq!(h.manager.list().len(), 1);
    assert!(thread.current_fiber_native_id().is_some());
    assert!(!thread.root_fiber().is_alive());
}
