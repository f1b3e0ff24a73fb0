//! Host-facing error types.
//!
//! Python-level exceptions stay inside the VM as typed values until they
//! reach the top frame uncaught; at that point they surface here as
//! [`Error::Exception`] with a rendered traceback. Cancellation, deadline,
//! and instruction-budget stops are their own variants because Python code
//! can never catch them.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::exceptions::render_traceback;
use crate::value::Value;

/// Everything `run`/`execute` can fail with.
#[derive(Debug, Error)]
pub enum Error {
    /// Source did not compile.
    #[error("{0}")]
    Compile(CompileError),

    /// An exception reached the top frame uncaught.
    #[error("{0}")]
    Exception(UncaughtException),

    /// The wall-clock deadline passed. Not catchable from Python.
    #[error("execution timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The cancellation token was tripped. Not catchable from Python.
    #[error("execution cancelled")]
    Cancelled,

    /// The configured instruction budget ran out.
    #[error("instruction limit exceeded ({0} instructions)")]
    InstructionLimit(u64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A compile-time failure with its source position.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub filename: String,
    pub line: u32,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  File \"{}\", line {}\nSyntaxError: {}",
            self.filename, self.line, self.message
        )
    }
}

impl std::error::Error for CompileError {}

/// An uncaught exception: the live exception value plus the rendered
/// traceback text (oldest frame first, chained through causes and contexts).
pub struct UncaughtException {
    value: Value,
    rendered: String,
}

impl UncaughtException {
    pub(crate) fn new(value: Value) -> Self {
        let rendered = render_traceback(&value);
        Self { value, rendered }
    }

    /// The exception value, for programmatic inspection.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The exception's class name (`"ValueError"`, ...).
    pub fn type_name(&self) -> String {
        match &self.value {
            Value::Exception(e) => e.borrow().class_name(),
            other => other.type_name(),
        }
    }

    /// The exception message without the class prefix.
    pub fn message(&self) -> String {
        match &self.value {
            Value::Exception(e) => e.borrow().message(),
            other => crate::format::plain_str(other),
        }
    }
}

impl fmt::Display for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl fmt::Debug for UncaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UncaughtException({}: {})", self.type_name(), self.message())
    }
}

impl std::error::Error for UncaughtException {}
