//! The cooperative execution contexts a guest thread drives.
//!
//! Only the root fiber is modelled: it is created with the thread, runs the
//! thread's task on the thread's native thread, and is torn down by
//! [`FiberManager::shutdown`] when the thread is killed.
use crate::{
    utils::sync::{Arc, AtomicBool, AtomicU64, Mutex, Ordering},
    value::Unwind,
};
use std::thread::{self, ThreadId};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct Fiber {
    id: u64,
    name: String,
    alive: AtomicBool,
    /// Native thread the fiber last ran on
    native: Mutex<Option<ThreadId>>,
}

impl Fiber {
    fn new(name: String) -> Self {
        Self {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            name,
            alive: AtomicBool::new(true),
            native: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn native_id(&self) -> Option<ThreadId> {
        *self.native.lock()
    }
}

/// Owns the fibers of one guest thread.
#[derive(Debug)]
pub struct FiberManager {
    root: Arc<Fiber>,
    current: Mutex<Arc<Fiber>>,
}

impl FiberManager {
    pub fn new(thread_name: &str) -> Self {
        let root = Arc::new(Fiber::new(format!("root fiber of {}", thread_name)));
        Self {
            current: Mutex::new(root.clone()),
            root,
        }
    }

    pub fn root_fiber(&self) -> Arc<Fiber> {
        self.root.clone()
    }

    pub fn current_fiber(&self) -> Arc<Fiber> {
        self.current.lock().clone()
    }

    /// Run `task` as `fiber` on the calling native thread.
    pub fn run<T>(
        &self,
        fiber: &Arc<Fiber>,
        task: impl FnOnce() -> Result<T, Unwind>,
    ) -> Result<T, Unwind> {
        if !fiber.is_alive() {
            return Err(Unwind::ThreadExit);
        }
        *fiber.native.lock() = Some(thread::current().id());
        *self.current.lock() = fiber.clone();
        let result = task();
        fiber.alive.store(false, Ordering::Release);
        result
    }

    /// Tear down every fiber owned by the thread.
    pub fn shutdown(&self) {
        self.root.alive.store(false, Ordering::Release);
        self.current.lock().alive.store(false, Ordering::Release);
    }
}
