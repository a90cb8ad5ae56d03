//! Record type definitions for the trace log
//!
//! These types represent the two event streams written to the log: synchronous
//! API callbacks and asynchronously delivered memory activity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in nanoseconds, as reported by the platform clock
pub type Timestamp = u64;

/// Correlation id assigned by CUPTI to every API call
pub type CorrelationId = u32;

/// Callback id within a domain (CUPTI `CUpti_CallbackId`)
pub type CallbackId = u32;

/// Discriminator written as the first field of every log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Callback,
    ActivityMemory,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Callback => "CALLBACK",
            Category::ActivityMemory => "ACTIVITY_MEMORY",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = crate::protocol::line::LineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CALLBACK" => Ok(Category::Callback),
            "ACTIVITY_MEMORY" => Ok(Category::ActivityMemory),
            other => Err(crate::protocol::line::LineError::UnknownCategory(
                other.to_string(),
            )),
        }
    }
}

/// API domain a callback was delivered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackDomain {
    DriverApi,
    RuntimeApi,
    /// Any other CUPTI domain, kept by raw id
    Other(u32),
}

impl CallbackDomain {
    pub const DRIVER_API_ID: u32 = 1;
    pub const RUNTIME_API_ID: u32 = 2;

    /// Numeric CUPTI domain id, which is what the log carries
    pub fn raw(&self) -> u32 {
        match self {
            CallbackDomain::DriverApi => Self::DRIVER_API_ID,
            CallbackDomain::RuntimeApi => Self::RUNTIME_API_ID,
            CallbackDomain::Other(raw) => *raw,
        }
    }
}

/// Whether a callback fired on entry to or exit from the API call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallbackSite {
    Enter,
    Exit,
    Unknown(u32),
}

impl CallbackSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackSite::Enter => "ENTER",
            CallbackSite::Exit => "EXIT",
            CallbackSite::Unknown(_) => "UNKNOWN",
        }
    }
}

/// Memory operation reported by a memory activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryOperation {
    Alloc,
    Free,
    Unknown,
}

impl MemoryOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryOperation::Alloc => "ALLOC",
            MemoryOperation::Free => "FREE",
            MemoryOperation::Unknown => "UNKNOWN",
        }
    }
}

/// Kind of memory an activity record refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Pageable,
    Pinned,
    Device,
    Array,
    Managed,
    DeviceStatic,
    ManagedStatic,
    Unknown,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Pageable => "PAGEABLE",
            MemoryKind::Pinned => "PINNED",
            MemoryKind::Device => "DEVICE",
            MemoryKind::Array => "ARRAY",
            MemoryKind::Managed => "MANAGED",
            MemoryKind::DeviceStatic => "DEVICE_STATIC",
            MemoryKind::ManagedStatic => "MANAGED_STATIC",
            MemoryKind::Unknown => "UNKNOWN",
        }
    }
}

/// One entry/exit notification of an intercepted API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub correlation_id: CorrelationId,
    pub domain: CallbackDomain,
    pub cbid: CallbackId,
    pub site: CallbackSite,
    pub timestamp: Timestamp,

    /// Resolved name, present only for tracked operations
    pub api_name: Option<String>,

    /// Flattened native stack, present only on ENTER of a tracked operation
    pub native_stack: Option<String>,

    /// Flattened Python stack (or a sentinel), alongside `native_stack`
    pub python_stack: Option<String>,
}

/// One allocation or release reported by the activity API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryActivityRecord {
    pub correlation_id: CorrelationId,
    pub operation: MemoryOperation,
    pub kind: MemoryKind,
    pub timestamp: Timestamp,
    pub address: u64,
    pub size: u64,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
}
