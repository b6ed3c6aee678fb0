use crate::value::{ExceptionKind, GuestException, Unwind};
use thiserror::Error;

/// Errors raised at the thread API boundary.
#[derive(Debug, Error)]
pub enum ThreadError {
    /// `wakeup`/`run` on a thread that has already died.
    #[error("killed thread")]
    Killed,

    #[error("invalid timing symbol: {0}")]
    InvalidTiming(String),

    #[error("deadlock; recursive locking")]
    RecursiveLock,

    #[error("attempt to unlock a mutex which is not locked")]
    NotLocked,

    #[error("attempt to unlock a mutex which is locked by another thread")]
    NotOwner,

    #[error("Target thread must not be current thread")]
    JoinCurrent,

    #[error("calling native thread is not bound to a guest thread")]
    NotRegistered,

    #[error("runtime has been shut down")]
    ShutDown,

    /// Teardown attempted from a thread other than the root.
    #[error("runtime can only be shut down from the root thread")]
    NotRootThread,

    #[error("failed to spawn native thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ThreadError {
    /// The guest exception class this error is raised as.
    pub fn kind(&self) -> ExceptionKind {
        match self {
            ThreadError::InvalidTiming(_) => ExceptionKind::ArgumentError,
            ThreadError::Spawn(_) => ExceptionKind::RuntimeError,
            _ => ExceptionKind::ThreadError,
        }
    }
}

impl From<ThreadError> for GuestException {
    fn from(err: ThreadError) -> Self {
        GuestException::new(err.kind(), err.to_string())
    }
}

impl From<ThreadError> for Unwind {
    fn from(err: ThreadError) -> Self {
        Unwind::raise(err.into())
    }
}
