//! Log line protocol
//!
//! The trace is a line-oriented, tab-separated `key=value` text stream. Every
//! line starts with a `category=` field; there is no header, trailer or framing.

pub mod line;
