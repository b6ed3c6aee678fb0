//! Guest-visible values, exceptions and the control signals that unwind a
//! guest thread's task.
use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};
use thiserror::Error;

/// A value produced by guest code.
///
/// The object model proper lives outside this crate; threads only need to
/// carry a task's result back to whoever joins it.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// Class of a guest exception, as seen by supervisors and joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    StandardError,
    RuntimeError,
    ArgumentError,
    /// Misuse of a thread, e.g. resuming a dead one.
    ThreadError,
    /// Control flow that escaped the thread body, e.g. a non-local return.
    LocalJumpError,
    /// A native panic inside the thread body.
    Fatal,
}

impl ExceptionKind {
    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::StandardError => "StandardError",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::ArgumentError => "ArgumentError",
            ExceptionKind::ThreadError => "ThreadError",
            ExceptionKind::LocalJumpError => "LocalJumpError",
            ExceptionKind::Fatal => "fatal",
        }
    }
}

impl Display for ExceptionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A guest-level exception. Failures stored on a thread are shared as
/// `Arc<GuestException>`, so every re-raise hands out the same object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({kind})")]
pub struct GuestException {
    kind: ExceptionKind,
    message: String,
    backtrace: Vec<String>,
}

impl GuestException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ExceptionKind::RuntimeError, message)
    }

    pub fn unexpected_return() -> Self {
        Self::new(ExceptionKind::LocalJumpError, "unexpected return")
    }

    pub fn with_backtrace(mut self, backtrace: Vec<String>) -> Self {
        self.backtrace = backtrace;
        self
    }

    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn backtrace(&self) -> &[String] {
        &self.backtrace
    }
}

/// Control signals that unwind a guest task.
///
/// These travel on the `Err` side of a task's `Result` so that `?` carries
/// them to the thread's run loop, which decides what gets stored on the
/// thread. None of them reach the thread's creator directly.
#[derive(Debug, Clone, Error)]
pub enum Unwind {
    /// A guest exception is propagating.
    #[error("raised {0}")]
    Raise(Arc<GuestException>),
    /// A non-local return tried to leave the thread body.
    #[error("non-local return of {0}")]
    Return(Value),
    /// The thread is being terminated by `kill`.
    #[error("thread exit")]
    ThreadExit,
}

impl Unwind {
    pub fn raise(exception: GuestException) -> Self {
        Unwind::Raise(Arc::new(exception))
    }

    /// The exception being raised, if this is a raise.
    pub fn exception(&self) -> Option<&Arc<GuestException>> {
        match self {
            Unwind::Raise(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GuestException> for Unwind {
    fn from(exception: GuestException) -> Self {
        Unwind::raise(exception)
    }
}
