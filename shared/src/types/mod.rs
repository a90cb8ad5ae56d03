//! Trace record types

pub mod records;
