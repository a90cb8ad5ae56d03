//! `extern "C"` entry points registered with CUPTI
//!
//! CUPTI's buffer callbacks carry no user data, so the running pipeline lives
//! in a process-wide slot set once by [`install`]. Every trampoline body runs
//! under `catch_unwind`: a panic must not unwind into CUDA or the host.

use crate::activity::ActivityBuffer;
use crate::cupti::{sys, CallbackInfo};
use crate::error::{ProfilerError, Result};
use crate::lifecycle::Pipeline;
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, trace};

static PIPELINE: OnceCell<Arc<Pipeline>> = OnceCell::new();

/// Make `pipeline` the target of the CUPTI trampolines. Allowed once per process.
pub fn install(pipeline: Arc<Pipeline>) -> Result<()> {
    PIPELINE
        .set(pipeline)
        .map_err(|_| ProfilerError::AlreadyInitialized)
}

/// The installed pipeline, if any
pub fn installed() -> Option<&'static Arc<Pipeline>> {
    PIPELINE.get()
}

/// `CUpti_BuffersCallbackRequestFunc`
pub unsafe extern "C" fn buffer_requested(
    buffer: *mut *mut u8,
    size: *mut usize,
    max_num_records: *mut usize,
) {
    let granted = catch_unwind(|| {
        PIPELINE
            .get()
            .and_then(|pipeline| pipeline.collector.request_buffer())
            .map(ActivityBuffer::into_raw)
    })
    .unwrap_or_else(|_| {
        error!("panic while allocating activity buffer");
        None
    });
    let (ptr, len) = granted.unwrap_or((std::ptr::null_mut(), 0));

    if !buffer.is_null() {
        *buffer = ptr;
    }
    if !size.is_null() {
        *size = len;
    }
    // 0: fill the buffer with as many records as fit.
    if !max_num_records.is_null() {
        *max_num_records = 0;
    }
}

/// `CUpti_BuffersCallbackCompleteFunc`
pub unsafe extern "C" fn buffer_completed(
    _ctx: cudarc::driver::sys::CUcontext,
    stream_id: u32,
    buffer: *mut u8,
    size: usize,
    valid_size: usize,
) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        let Some(buffer) = ActivityBuffer::from_raw(buffer, size) else {
            return;
        };
        trace!(stream_id, valid_size, "Activity buffer completed");
        match PIPELINE.get() {
            Some(pipeline) => pipeline.collector.complete_buffer(buffer, valid_size),
            None => drop(buffer),
        }
    }));
    if result.is_err() {
        error!("panic while processing activity buffer");
    }
}

/// `CUpti_CallbackFunc` for the memory profiler
pub unsafe extern "C" fn api_callback(
    _userdata: *mut c_void,
    domain: sys::CUpti_CallbackDomain,
    cbid: sys::CUpti_CallbackId,
    cbdata: *const c_void,
) {
    use sys::CUpti_CallbackDomain::{CUPTI_CB_DOMAIN_DRIVER_API, CUPTI_CB_DOMAIN_RUNTIME_API};

    // Only the API domains deliver `CUpti_CallbackData`.
    if cbdata.is_null()
        || (domain != CUPTI_CB_DOMAIN_DRIVER_API && domain != CUPTI_CB_DOMAIN_RUNTIME_API)
    {
        return;
    }
    let Some(pipeline) = PIPELINE.get() else {
        return;
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        let data = &*(cbdata as *const sys::CUpti_CallbackData);
        let info = CallbackInfo::from_raw(data);
        pipeline.interceptor.on_callback(domain, cbid, &info);
    }));
    if result.is_err() {
        error!(?domain, cbid, "panic while handling API callback");
    }
}
