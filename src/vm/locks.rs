use crate::{
    error::ThreadError,
    utils::sync::{Arc, AtomicU64, Condvar, Mutex, Ordering},
    vm::interrupt::{wait_interruptibly, Blocker, Interrupted, NativeThread},
};
use std::time::Instant;

/// Owner id meaning "not locked". Managed thread ids start at 1.
const UNLOCKED: u64 = 0;

static NEXT_MUTEX_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct MutexState {
    /// Managed id of the owning guest thread
    owner_thread_id: u64,
}

/// A guest-visible mutual exclusion lock.
///
/// Unlike a host mutex it is owned by a guest thread rather than a scope: the
/// owner is recorded by managed thread id, and the runtime force-releases
/// whatever a thread still holds when it dies. Locking is not recursive.
///
/// Blocking acquisition goes through [`ThreadContext::lock`], which waits via
/// the interruptible retry loop so that a thread stuck on a lock can still be
/// killed.
///
/// [`ThreadContext::lock`]: crate::vm::ThreadContext::lock
#[derive(Debug)]
pub struct GuestMutex {
    id: u64,
    state: Mutex<MutexState>,
    condvar: Condvar,
}

impl GuestMutex {
    pub fn new() -> Self {
        Self {
            id: NEXT_MUTEX_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(MutexState {
                owner_thread_id: UNLOCKED,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().owner_thread_id != UNLOCKED
    }

    pub fn owner(&self) -> Option<u64> {
        match self.state.lock().owner_thread_id {
            UNLOCKED => None,
            id => Some(id),
        }
    }

    /// Try to take the lock without blocking.
    /// Returns false if another thread holds it.
    pub fn try_enter(&self, thread_id: u64) -> Result<bool, ThreadError> {
        let mut state = self.state.lock();
        if state.owner_thread_id == thread_id {
            return Err(ThreadError::RecursiveLock);
        }
        if state.owner_thread_id == UNLOCKED {
            state.owner_thread_id = thread_id;
            return Ok(true);
        }
        Ok(false)
    }

    /// One blocking attempt at taking the lock. Returns false at `deadline`.
    pub(crate) fn enter_interruptibly(
        self: &Arc<Self>,
        thread_id: u64,
        native: &NativeThread,
        deadline: Option<Instant>,
    ) -> Result<bool, Interrupted> {
        wait_interruptibly(
            native,
            self.clone(),
            &self.state,
            &self.condvar,
            deadline,
            |state| {
                if state.owner_thread_id == UNLOCKED {
                    state.owner_thread_id = thread_id;
                    true
                } else {
                    false
                }
            },
        )
    }

    /// Release the lock held by `thread_id`.
    pub fn exit(&self, thread_id: u64) -> Result<(), ThreadError> {
        let mut state = self.state.lock();
        if state.owner_thread_id == UNLOCKED {
            return Err(ThreadError::NotLocked);
        }
        if state.owner_thread_id != thread_id {
            return Err(ThreadError::NotOwner);
        }
        state.owner_thread_id = UNLOCKED;
        self.condvar.notify_all();
        Ok(())
    }

    /// Release the lock if `thread_id` still owns it, regardless of how the
    /// owner got here. Returns whether anything was released.
    pub(crate) fn force_unlock(&self, thread_id: u64) -> bool {
        self.exit(thread_id).is_ok()
    }
}

impl Default for GuestMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocker for GuestMutex {
    fn unblock(&self) {
        let _state = self.state.lock();
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_try_enter_and_exit() {
        let mutex = GuestMutex::new();
        assert!(mutex.try_enter(1).unwrap());
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(1));
        assert!(!mutex.try_enter(2).unwrap());

        assert!(matches!(mutex.exit(2), Err(ThreadError::NotOwner)));
        mutex.exit(1).unwrap();
        assert!(!mutex.is_locked());
        assert!(matches!(mutex.exit(1), Err(ThreadError::NotLocked)));
    }

    #[test]
    fn test_not_recursive() {
        let mutex = GuestMutex::new();
        assert!(mutex.try_enter(1).unwrap());
        assert!(matches!(mutex.try_enter(1), Err(ThreadError::RecursiveLock)));
    }

    #[test]
    fn test_force_unlock_only_for_owner() {
        let mutex = GuestMutex::new();
        assert!(!mutex.force_unlock(1));
        mutex.try_enter(1).unwrap();
        assert!(!mutex.force_unlock(2));
        assert!(mutex.force_unlock(1));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_contended_enter_wakes_on_exit() {
        let mutex = Arc::new(GuestMutex::new());
        mutex.try_enter(1).unwrap();

        let mutex_clone = mutex.clone();
        let handle = thread::spawn(move || {
            let native = NativeThread::current();
            mutex_clone.enter_interruptibly(2, &native, None)
        });

        thread::sleep(Duration::from_millis(20));
        mutex.exit(1).unwrap();

        assert_eq!(handle.join().unwrap(), Ok(true));
        assert_eq!(mutex.owner(), Some(2));
    }

    #[test]
    fn test_enter_times_out() {
        let mutex = Arc::new(GuestMutex::new());
        mutex.try_enter(1).unwrap();
        let native = NativeThread::current();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(mutex.enter_interruptibly(2, &native, Some(deadline)), Ok(false));
        assert_eq!(mutex.owner(), Some(1));
    }
}
