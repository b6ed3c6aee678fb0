use crate::{utils::sync::Arc, vm::thread::GuestThread};
use dashmap::DashMap;
use std::thread::ThreadId;

/// The set of live guest threads of one runtime.
///
/// Registration, unregistration and lookups may come from any native thread
/// concurrently.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    /// Map from managed thread ID to thread
    threads: DashMap<u64, Arc<GuestThread>>,
    /// Map from native OS thread to the managed thread bound to it
    natives: DashMap<ThreadId, u64>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread: Arc<GuestThread>, native_id: ThreadId) {
        self.natives.insert(native_id, thread.id());
        self.threads.insert(thread.id(), thread);
    }

    /// Returns false if the thread was not registered.
    pub fn unregister(&self, thread: &GuestThread) -> bool {
        self.natives.retain(|_, id| *id != thread.id());
        self.threads.remove(&thread.id()).is_some()
    }

    pub fn get(&self, managed_id: u64) -> Option<Arc<GuestThread>> {
        self.threads.get(&managed_id).map(|t| t.clone())
    }

    pub fn find_by_native(&self, native_id: ThreadId) -> Option<Arc<GuestThread>> {
        let managed_id = *self.natives.get(&native_id)?;
        self.get(managed_id)
    }

    pub fn contains(&self, managed_id: u64) -> bool {
        self.threads.contains_key(&managed_id)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Every registered thread, ordered by managed id.
    pub fn snapshot(&self) -> Vec<Arc<GuestThread>> {
        let mut threads: Vec<_> = self.threads.iter().map(|t| t.value().clone()).collect();
        threads.sort_by_key(|t| t.id());
        threads
    }
}
