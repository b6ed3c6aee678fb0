//! Guest thread runtime: lifecycle, blocking, cross-thread actions and locks.
mod blocking;
mod config;
mod context;
mod fiber;
mod interrupt;
mod locks;
mod metrics;
mod registry;
mod safepoint;
mod signal;
mod thread;
mod threading;

pub use blocking::BlockingAction;
pub use config::RuntimeConfig;
pub use context::ThreadContext;
pub use fiber::{Fiber, FiberManager};
pub use interrupt::{Blocker, Interrupted, NativeThread};
pub use locks::GuestMutex;
pub use metrics::RuntimeMetrics;
pub use registry::ThreadRegistry;
pub use safepoint::{PollSite, SafepointAction, SafepointCoordinator};
pub use signal::CompletionSignal;
pub use thread::{GuestThread, InterruptMode, InterruptModeGuard, ThreadStatus};
pub use threading::ThreadManager;
