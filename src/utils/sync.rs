//! Basic synchronization primitives.
//!
//! Every cross-thread structure in the runtime goes through this module, so the
//! choice of lock implementation lives in one place.
use std::cell::Cell;

pub use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

pub use parking_lot::{Condvar, Mutex, RwLock};

thread_local! {
    /// Cached managed id of the guest thread bound to this native thread
    pub(crate) static MANAGED_THREAD_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Get the managed id of the guest thread bound to the calling native thread.
/// Returns `None` if no guest thread has been started here.
pub fn get_current_thread_id() -> Option<u64> {
    MANAGED_THREAD_ID.with(|id| id.get())
}

pub(crate) fn set_current_thread_id(id: Option<u64>) {
    MANAGED_THREAD_ID.with(|cell| cell.set(id));
}
