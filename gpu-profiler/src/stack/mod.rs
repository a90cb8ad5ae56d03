//! Call stack capture
//!
//! Both captures run on the interception hot path, on whatever thread made the
//! CUDA call. Neither may panic, block indefinitely or disturb the caller:
//! failures degrade to the sentinel strings below instead of errors.

pub mod native;
pub mod python;

pub use native::capture_native_stack;
pub use python::PythonStack;

/// The interpreter is not loaded or not initialized
pub const NOT_INITIALIZED: &str = "not initialized";

/// The calling thread does not hold the interpreter's execution lock (GIL)
pub const LOCK_NOT_HELD: &str = "lock not held";

/// Capture was attempted and failed
pub const STACK_UNAVAILABLE: &str = "stack unavailable";

/// Python capture disabled by configuration
pub const CAPTURE_DISABLED: &str = "disabled";

/// Which stacks this process can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub native: bool,
    pub interpreted: bool,
}

/// Source of call stacks for tracked API calls.
pub trait StackCapturer: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Native stack flattened onto one line
    fn native_stack(&self) -> String;

    /// Interpreted stack flattened onto one line, or a sentinel
    fn interpreted_stack(&self) -> String;
}

/// Captures the real native stack and, when an interpreter is present, the
/// Python stack of the current thread.
pub struct ProcessStackCapturer {
    python: Option<PythonStack>,
}

impl ProcessStackCapturer {
    /// `capture_python = false` skips interpreter probing entirely.
    pub fn new(capture_python: bool) -> Self {
        Self {
            python: capture_python.then(PythonStack::new),
        }
    }
}

impl StackCapturer for ProcessStackCapturer {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native: true,
            interpreted: self.python.as_ref().is_some_and(|p| p.is_available()),
        }
    }

    fn native_stack(&self) -> String {
        capture_native_stack()
    }

    fn interpreted_stack(&self) -> String {
        match &self.python {
            Some(python) => python.capture(),
            None => CAPTURE_DISABLED.to_string(),
        }
    }
}
