//! CUDA memory tracing
//!
//! Loaded into a CUDA process as a shared library, the profiler records two
//! independent event streams into one log:
//!
//! - `CALLBACK` lines for every driver/runtime API entry and exit, with native
//!   and Python stacks attached to the entry of allocation-related calls
//! - `ACTIVITY_MEMORY` lines for every allocation and release CUPTI reports
//!
//! The streams are joined downstream on `correlationId`.

pub mod activity;
pub mod config;
pub mod cupti;
pub mod entry;
pub mod error;
pub mod hooks;
pub mod interceptor;
pub mod launch;
pub mod lifecycle;
pub mod sink;
pub mod stack;

pub use activity::{ActivityBuffer, ActivityCollector, CollectorStats};
pub use config::Config;
pub use error::{ProfilerError, Result};
pub use interceptor::Interceptor;
pub use lifecycle::{Pipeline, Profiler, ShutdownReport};
pub use sink::{EventSink, FileDestination, LogDestination, MemoryDestination};
pub use stack::{ProcessStackCapturer, StackCapturer};
