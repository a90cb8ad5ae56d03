//! CUDA CUPTI integration
//!
//! Types, enumerations and callback ids come from `cudarc`'s generated
//! bindings. [`CuptiApi`] is the seam between the tracing pipeline and CUPTI:
//! [`DynamicCupti`] forwards to the real library, tests substitute an
//! in-process fake.

pub mod loader;

pub use cudarc::cupti::sys;
pub use loader::DynamicCupti;

use crate::error::ProfilerError;
use cuprof_shared::{CallbackDomain, CallbackSite, MemoryKind, MemoryOperation};
use std::ffi::{c_char, CStr};
use std::fmt;
use sys::{CUpti_ActivityMemoryKind as MemKind, CUpti_ActivityMemoryOperationType as MemOp};

/// Runtime and driver API callback ids the profiler refers to by name
pub mod cbid {
    use super::sys::{
        CUpti_driver_api_trace_cbid as Driver, CUpti_runtime_api_trace_cbid as Runtime,
    };

    pub const CUDA_MALLOC: u32 = Runtime::CUPTI_RUNTIME_TRACE_CBID_cudaMalloc_v3020 as u32;
    pub const CUDA_FREE: u32 = Runtime::CUPTI_RUNTIME_TRACE_CBID_cudaFree_v3020 as u32;
    pub const CUDA_MALLOC_MANAGED: u32 =
        Runtime::CUPTI_RUNTIME_TRACE_CBID_cudaMallocManaged_v6000 as u32;

    pub const CU_MEM_CREATE: u32 = Driver::CUPTI_DRIVER_TRACE_CBID_cuMemCreate as u32;
    pub const CU_MEM_RELEASE: u32 = Driver::CUPTI_DRIVER_TRACE_CBID_cuMemRelease as u32;
    pub const CU_MEM_SET_ACCESS: u32 = Driver::CUPTI_DRIVER_TRACE_CBID_cuMemSetAccess as u32;
    pub const CU_LAUNCH_KERNEL: u32 = Driver::CUPTI_DRIVER_TRACE_CBID_cuLaunchKernel as u32;
    pub const CU_LAUNCH_KERNEL_EX: u32 = Driver::CUPTI_DRIVER_TRACE_CBID_cuLaunchKernelEx as u32;
}

/// Status code returned by a failed CUPTI call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CuptiStatus(pub sys::CUptiResult);

impl fmt::Display for CuptiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Opaque CUPTI subscriber handle.
///
/// Stored as an address so it can cross threads; only CUPTI dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberHandle(pub usize);

/// Decoder position inside an activity buffer: byte offset of the record most
/// recently returned, or nothing before the first call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordCursor(Option<usize>);

impl RecordCursor {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn offset(&self) -> Option<usize> {
        self.0
    }

    pub fn advance_to(&mut self, offset: usize) {
        self.0 = Some(offset);
    }
}

/// Fields of a memory activity record, still in CUPTI's enumerations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMemoryActivity {
    pub memory_operation_type: MemOp,
    pub memory_kind: MemKind,
    pub correlation_id: u32,
    pub address: u64,
    pub bytes: u64,
    pub timestamp: u64,
    pub device_id: u32,
    pub context_id: u32,
    pub stream_id: u32,
}

/// One decoded activity record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawActivity {
    Memory(RawMemoryActivity),
    /// Any other kind, by raw id; CUPTI may report kinds newer than the bindings.
    Other { kind: u32 },
}

/// Result of asking the decoder for the next record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRecord {
    Record(RawActivity),
    EndOfBuffer,
    Error(CuptiStatus),
}

pub fn memory_operation(op: MemOp) -> MemoryOperation {
    match op {
        MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_ALLOCATION => MemoryOperation::Alloc,
        MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_RELEASE => MemoryOperation::Free,
        _ => MemoryOperation::Unknown,
    }
}

pub fn memory_kind(kind: MemKind) -> MemoryKind {
    match kind {
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_PAGEABLE => MemoryKind::Pageable,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_PINNED => MemoryKind::Pinned,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_DEVICE => MemoryKind::Device,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_ARRAY => MemoryKind::Array,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_MANAGED => MemoryKind::Managed,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_DEVICE_STATIC => MemoryKind::DeviceStatic,
        MemKind::CUPTI_ACTIVITY_MEMORY_KIND_MANAGED_STATIC => MemoryKind::ManagedStatic,
        _ => MemoryKind::Unknown,
    }
}

pub fn callback_domain(domain: sys::CUpti_CallbackDomain) -> CallbackDomain {
    match domain {
        sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API => CallbackDomain::DriverApi,
        sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_RUNTIME_API => CallbackDomain::RuntimeApi,
        other => CallbackDomain::Other(other as u32),
    }
}

pub fn callback_site(site: sys::CUpti_ApiCallbackSite) -> CallbackSite {
    match site {
        sys::CUpti_ApiCallbackSite::CUPTI_API_ENTER => CallbackSite::Enter,
        sys::CUpti_ApiCallbackSite::CUPTI_API_EXIT => CallbackSite::Exit,
        other => CallbackSite::Unknown(other as u32),
    }
}

/// The parts of `CUpti_CallbackData` the interceptor looks at
#[derive(Debug, Clone, Copy)]
pub struct CallbackInfo<'a> {
    pub site: CallbackSite,
    pub correlation_id: u32,
    pub function_name: Option<&'a str>,
    pub symbol_name: Option<&'a str>,
}

impl<'a> CallbackInfo<'a> {
    /// Borrow the fields of a driver or runtime API callback.
    ///
    /// # Safety
    /// `data` must be the `CUpti_CallbackData` CUPTI passed to the current
    /// callback; its strings are only valid for the duration of that callback.
    pub unsafe fn from_raw(data: &'a sys::CUpti_CallbackData) -> Self {
        Self {
            site: callback_site(data.callbackSite),
            correlation_id: data.correlationId,
            function_name: c_str(data.functionName),
            symbol_name: c_str(data.symbolName),
        }
    }
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        CStr::from_ptr(ptr).to_str().ok()
    }
}

/// CUPTI operations used by the profiler.
///
/// Implementations are called from arbitrary threads, including CUPTI's own
/// buffer delivery threads.
pub trait CuptiApi: Send + Sync {
    /// `cuptiActivityEnable`
    fn activity_enable(&self, kind: sys::CUpti_ActivityKind) -> Result<(), CuptiStatus>;

    /// `cuptiActivityRegisterCallbacks`
    fn register_buffer_callbacks(
        &self,
        requested: sys::CUpti_BuffersCallbackRequestFunc,
        completed: sys::CUpti_BuffersCallbackCompleteFunc,
    ) -> Result<(), CuptiStatus>;

    /// `cuptiSubscribe` with null user data
    fn subscribe(&self, callback: sys::CUpti_CallbackFunc) -> Result<SubscriberHandle, CuptiStatus>;

    /// `cuptiUnsubscribe`
    fn unsubscribe(&self, subscriber: SubscriberHandle) -> Result<(), CuptiStatus>;

    /// `cuptiEnableDomain(1, subscriber, domain)`
    fn enable_domain(
        &self,
        subscriber: SubscriberHandle,
        domain: sys::CUpti_CallbackDomain,
    ) -> Result<(), CuptiStatus>;

    /// `cuptiActivityFlushAll`
    fn flush_all(&self, flag: u32) -> Result<(), CuptiStatus>;

    /// `cuptiActivityGetNextRecord` over the valid prefix of a completed buffer
    fn next_record(&self, buffer: &[u8], cursor: &mut RecordCursor) -> NextRecord;

    /// `cuptiGetTimestamp`, the clock activity records are stamped with
    fn timestamp(&self) -> Option<u64>;

    /// `cuptiGetResultString`
    fn result_string(&self, status: CuptiStatus) -> String;
}

/// Turn a failed CUPTI call into a [`ProfilerError`] carrying CUPTI's own message.
pub fn cupti_error(api: &dyn CuptiApi, call: &'static str, status: CuptiStatus) -> ProfilerError {
    ProfilerError::Cupti {
        call,
        status: status.0 as u32,
        message: api.result_string(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_starts_before_first_record() {
        let mut cursor = RecordCursor::new();
        assert_eq!(cursor.offset(), None);
        cursor.advance_to(64);
        assert_eq!(cursor.offset(), Some(64));
    }

    #[test]
    fn test_callback_info_from_raw() {
        let mut data: sys::CUpti_CallbackData = unsafe { std::mem::zeroed() };
        data.callbackSite = sys::CUpti_ApiCallbackSite::CUPTI_API_EXIT;
        data.functionName = b"cudaMalloc\0".as_ptr() as *const c_char;
        data.correlationId = 42;

        let info = unsafe { CallbackInfo::from_raw(&data) };
        assert_eq!(info.site, CallbackSite::Exit);
        assert_eq!(info.correlation_id, 42);
        assert_eq!(info.function_name, Some("cudaMalloc"));
        assert_eq!(info.symbol_name, None);
    }

    #[test]
    fn test_callback_ids_match_cupti_headers() {
        assert_eq!(cbid::CUDA_MALLOC, 20);
        assert_eq!(cbid::CUDA_FREE, 22);
        assert_eq!(cbid::CUDA_MALLOC_MANAGED, 211);
        assert_eq!(cbid::CU_LAUNCH_KERNEL, 307);
        assert_eq!(cbid::CU_MEM_CREATE, 596);
        assert_eq!(cbid::CU_MEM_RELEASE, 597);
        assert_eq!(cbid::CU_MEM_SET_ACCESS, 600);
    }

    #[test]
    fn test_memory_enumerations() {
        assert_eq!(
            memory_operation(MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_ALLOCATION),
            MemoryOperation::Alloc
        );
        assert_eq!(
            memory_operation(MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_RELEASE),
            MemoryOperation::Free
        );
        assert_eq!(
            memory_operation(MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_INVALID),
            MemoryOperation::Unknown
        );

        let expected = [
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_PAGEABLE, "PAGEABLE"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_PINNED, "PINNED"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_DEVICE, "DEVICE"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_ARRAY, "ARRAY"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_MANAGED, "MANAGED"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_DEVICE_STATIC, "DEVICE_STATIC"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_MANAGED_STATIC, "MANAGED_STATIC"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_UNKNOWN, "UNKNOWN"),
            (MemKind::CUPTI_ACTIVITY_MEMORY_KIND_FORCE_INT, "UNKNOWN"),
        ];
        for (raw, name) in expected {
            assert_eq!(memory_kind(raw).as_str(), name);
        }
    }

    #[test]
    fn test_domain_ids_agree_with_log_format() {
        let driver = sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API;
        let runtime = sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_RUNTIME_API;
        let resource = sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_RESOURCE;

        assert_eq!(callback_domain(driver), CallbackDomain::DriverApi);
        assert_eq!(callback_domain(driver).raw(), driver as u32);
        assert_eq!(callback_domain(runtime).raw(), runtime as u32);
        assert_eq!(callback_domain(resource), CallbackDomain::Other(resource as u32));
    }

    #[test]
    fn test_site_mapping() {
        assert_eq!(
            callback_site(sys::CUpti_ApiCallbackSite::CUPTI_API_ENTER),
            CallbackSite::Enter
        );
        assert_eq!(
            callback_site(sys::CUpti_ApiCallbackSite::CUPTI_API_CBSITE_FORCE_INT).as_str(),
            "UNKNOWN"
        );
    }
}
