//! The real CUPTI, reached through `cudarc`.
//!
//! `cudarc` loads `libcupti` on first use and panics if it cannot find it. The
//! configured library is opened up front with `libloading` instead, so a
//! missing CUPTI becomes an error, and `cudarc`'s lookup by soname then
//! resolves to the copy already resident in the process.

use super::{sys, CuptiApi, CuptiStatus, NextRecord, RawActivity, RawMemoryActivity, RecordCursor, SubscriberHandle};
use crate::error::{ProfilerError, Result};
use cudarc::cupti::result as cupti;
use libloading::Library;
use std::ffi::{c_char, CStr};
use std::mem::{offset_of, size_of};
use std::ptr::addr_of;
use tracing::{debug, info};

/// Handle on the CUPTI library loaded into this process
pub struct DynamicCupti {
    _lib: Library,
}

impl DynamicCupti {
    /// Load `library` (a soname or a path) and check that it is CUPTI.
    pub fn load(library: &str) -> Result<Self> {
        info!("Loading CUPTI from {}", library);

        let lib = unsafe { Library::new(library) }.map_err(|e| ProfilerError::LibraryLoad {
            library: library.to_string(),
            message: e.to_string(),
        })?;

        unsafe { lib.get::<unsafe extern "C" fn()>(b"cuptiSubscribe\0") }.map_err(|e| {
            ProfilerError::LibraryLoad {
                library: library.to_string(),
                message: format!("missing symbol cuptiSubscribe: {}", e),
            }
        })?;

        debug!("CUPTI loaded");
        Ok(Self { _lib: lib })
    }
}

fn status(err: cupti::CuptiError) -> CuptiStatus {
    CuptiStatus(err.0)
}

/// Byte length of `CUpti_ActivityMemory4` up to and including `streamId`.
/// Older CUPTI releases write shorter memory records with the same prefix.
const MEMORY_RECORD_PREFIX: usize =
    offset_of!(sys::CUpti_ActivityMemory4, streamId) + size_of::<u32>();

impl CuptiApi for DynamicCupti {
    fn activity_enable(&self, kind: sys::CUpti_ActivityKind) -> Result<(), CuptiStatus> {
        cupti::activity::enable(kind).map_err(status)
    }

    fn register_buffer_callbacks(
        &self,
        requested: sys::CUpti_BuffersCallbackRequestFunc,
        completed: sys::CUpti_BuffersCallbackCompleteFunc,
    ) -> Result<(), CuptiStatus> {
        cupti::activity::register_callbacks(requested, completed).map_err(status)
    }

    fn subscribe(&self, callback: sys::CUpti_CallbackFunc) -> Result<SubscriberHandle, CuptiStatus> {
        let mut handle: sys::CUpti_SubscriberHandle = std::ptr::null_mut();
        unsafe { cupti::subscribe(&mut handle, callback, std::ptr::null_mut()) }.map_err(status)?;
        Ok(SubscriberHandle(handle as usize))
    }

    fn unsubscribe(&self, subscriber: SubscriberHandle) -> Result<(), CuptiStatus> {
        unsafe { cupti::unsubscribe(subscriber.0 as sys::CUpti_SubscriberHandle) }.map_err(status)
    }

    fn enable_domain(
        &self,
        subscriber: SubscriberHandle,
        domain: sys::CUpti_CallbackDomain,
    ) -> Result<(), CuptiStatus> {
        unsafe { cupti::enable_domain(1, subscriber.0 as sys::CUpti_SubscriberHandle, domain) }
            .map_err(status)
    }

    fn flush_all(&self, flag: u32) -> Result<(), CuptiStatus> {
        cupti::activity::flush_all(flag).map_err(status)
    }

    fn next_record(&self, buffer: &[u8], cursor: &mut RecordCursor) -> NextRecord {
        let base = buffer.as_ptr() as *mut u8;
        let mut record: *mut sys::CUpti_Activity = match cursor.offset() {
            // SAFETY: offsets only ever come from records CUPTI returned for this buffer
            Some(offset) => unsafe { base.add(offset) as *mut sys::CUpti_Activity },
            None => std::ptr::null_mut(),
        };

        // CUPTI only reads the buffer; the mutable pointer is an artifact of its C signature.
        let result = unsafe { cupti::activity::get_next_record(base, buffer.len(), &mut record) };
        match result {
            Ok(()) => {}
            Err(e) if e.0 == sys::CUptiResult::CUPTI_ERROR_MAX_LIMIT_REACHED => {
                return NextRecord::EndOfBuffer
            }
            Err(e) => return NextRecord::Error(status(e)),
        }
        if record.is_null() {
            return NextRecord::EndOfBuffer;
        }

        let offset = record as usize - base as usize;
        let invalid = NextRecord::Error(CuptiStatus(sys::CUptiResult::CUPTI_ERROR_INVALID_PARAMETER));
        if offset + size_of::<u32>() > buffer.len() {
            return invalid;
        }
        cursor.advance_to(offset);

        // Read as a plain integer: the kind may be newer than these bindings.
        let kind = unsafe { std::ptr::read_unaligned(record as *const u32) };
        if kind != sys::CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MEMORY2 as u32 {
            return NextRecord::Record(RawActivity::Other { kind });
        }
        if offset + MEMORY_RECORD_PREFIX > buffer.len() {
            return invalid;
        }

        // SAFETY: bounds checked above; CUPTI stamps the record with its kind.
        let mem = record as *const sys::CUpti_ActivityMemory4;
        let raw = unsafe {
            RawMemoryActivity {
                memory_operation_type: addr_of!((*mem).memoryOperationType).read_unaligned(),
                memory_kind: addr_of!((*mem).memoryKind).read_unaligned(),
                correlation_id: addr_of!((*mem).correlationId).read_unaligned(),
                address: addr_of!((*mem).address).read_unaligned(),
                bytes: addr_of!((*mem).bytes).read_unaligned(),
                timestamp: addr_of!((*mem).timestamp).read_unaligned(),
                device_id: addr_of!((*mem).deviceId).read_unaligned(),
                context_id: addr_of!((*mem).contextId).read_unaligned(),
                stream_id: addr_of!((*mem).streamId).read_unaligned(),
            }
        };
        NextRecord::Record(RawActivity::Memory(raw))
    }

    fn timestamp(&self) -> Option<u64> {
        let mut ts = 0u64;
        let rc = unsafe { sys::cuptiGetTimestamp(&mut ts) };
        (rc == sys::CUptiResult::CUPTI_SUCCESS).then_some(ts)
    }

    fn result_string(&self, status: CuptiStatus) -> String {
        let mut message: *const c_char = std::ptr::null();
        let rc = unsafe { sys::cuptiGetResultString(status.0, &mut message) };
        if rc != sys::CUptiResult::CUPTI_SUCCESS || message.is_null() {
            return status.to_string();
        }
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}
