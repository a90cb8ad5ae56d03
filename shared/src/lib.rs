//! Shared types and utilities for cuprof
//!
//! This crate contains the record data model written to the trace log, the
//! line format itself, and small helpers used by the profiler crate.

pub mod protocol;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use protocol::line::{LineError, LogLine};
pub use types::records::*;
