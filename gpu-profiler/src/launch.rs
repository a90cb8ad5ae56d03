//! Kernel launch inspector
//!
//! Reports whether kernels are launched with programmatic dependent launch
//! (PDL) enabled. Prints one line per `cuLaunchKernel`/`cuLaunchKernelEx` to
//! stdout. Uses its own CUPTI subscription, so it cannot run alongside the
//! memory profiler in the same process.

use crate::cupti::{cbid, cupti_error, sys, CallbackInfo, CuptiApi, SubscriberHandle};
use crate::error::Result;
use cudarc::driver::sys as driver;
use cuprof_shared::CallbackSite;
use std::ffi::c_void;
use std::fmt;
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

static LAUNCHES_SEEN: AtomicU64 = AtomicU64::new(0);

/// `CU_LAUNCH_ATTRIBUTE_PROGRAMMATIC_STREAM_SERIALIZATION`
pub const PDL_ATTRIBUTE: u32 =
    driver::CUlaunchAttributeID::CU_LAUNCH_ATTRIBUTE_PROGRAMMATIC_STREAM_SERIALIZATION as u32;

/// Parameter block CUPTI hands over for `cuLaunchKernelEx`
/// (`cuLaunchKernelEx_params_st` in `generated_cuda_meta.h`)
#[repr(C)]
pub struct LaunchKernelExParams {
    pub config: *const driver::CUlaunchConfig,
    pub f: driver::CUfunction,
    pub kernel_params: *mut *mut c_void,
    pub extra: *mut *mut c_void,
}

/// One launch attribute, reduced to what the PDL check needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchAttribute {
    pub id: u32,
    /// Leading `int` of the attribute value union
    pub value: i32,
}

/// True when the programmatic stream serialization attribute is set non-zero.
pub fn pdl_enabled(attrs: &[LaunchAttribute]) -> bool {
    attrs
        .iter()
        .any(|a| a.id == PDL_ATTRIBUTE && a.value != 0)
}

/// A launch worth reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport<'a> {
    pub function_name: Option<&'a str>,
    pub symbol_name: Option<&'a str>,
    pub enable_pdl: bool,
}

impl fmt::Display for LaunchReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[launch_inspector] functionName={} symbolName={} enable_pdl={}",
            self.function_name.unwrap_or(""),
            self.symbol_name.unwrap_or(""),
            u8::from(self.enable_pdl)
        )
    }
}

/// Classify a driver API callback. `attrs` is only consulted for
/// `cuLaunchKernelEx`.
pub fn inspect<'a>(
    cbid: u32,
    info: &CallbackInfo<'a>,
    attrs: impl FnOnce() -> Vec<LaunchAttribute>,
) -> Option<LaunchReport<'a>> {
    if info.site != CallbackSite::Enter {
        return None;
    }
    let enable_pdl = match cbid {
        cbid::CU_LAUNCH_KERNEL => false,
        cbid::CU_LAUNCH_KERNEL_EX => pdl_enabled(&attrs()),
        _ => return None,
    };
    Some(LaunchReport {
        function_name: info.function_name,
        symbol_name: info.symbol_name,
        enable_pdl,
    })
}

/// Read the launch attributes out of `cuLaunchKernelEx` parameters.
///
/// # Safety
/// `params` must be null or point to the [`LaunchKernelExParams`] of the
/// current callback.
pub unsafe fn read_launch_attributes(params: *const c_void) -> Vec<LaunchAttribute> {
    let params = params as *const LaunchKernelExParams;
    if params.is_null() || (*params).config.is_null() {
        return Vec::new();
    }
    let config = &*(*params).config;
    if config.attrs.is_null() || config.numAttrs == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(config.attrs, config.numAttrs as usize)
        .iter()
        .map(|attr| LaunchAttribute {
            id: attr.id as u32,
            value: attr.value.programmaticStreamSerializationAllowed,
        })
        .collect()
}

/// `CUpti_CallbackFunc` for the launch inspector
pub unsafe extern "C" fn launch_callback(
    _userdata: *mut c_void,
    domain: sys::CUpti_CallbackDomain,
    cbid: sys::CUpti_CallbackId,
    cbdata: *const c_void,
) {
    if domain != sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API || cbdata.is_null() {
        return;
    }
    let result = catch_unwind(AssertUnwindSafe(|| {
        let data = &*(cbdata as *const sys::CUpti_CallbackData);
        let info = CallbackInfo::from_raw(data);
        let report = inspect(cbid, &info, || read_launch_attributes(data.functionParams));
        if let Some(report) = report {
            LAUNCHES_SEEN.fetch_add(1, Ordering::Relaxed);
            // stdout may be closed; never panic over it.
            let _ = writeln!(std::io::stdout().lock(), "{}", report);
        }
    }));
    if result.is_err() {
        error!(cbid, "panic while inspecting kernel launch");
    }
}

/// Active launch inspector subscription
pub struct LaunchInspector {
    api: Arc<dyn CuptiApi>,
    /// Cleared once unsubscribed
    subscriber: Mutex<Option<SubscriberHandle>>,
}

impl LaunchInspector {
    /// Subscribe to the driver API domain.
    pub fn init(api: Arc<dyn CuptiApi>) -> Result<Self> {
        info!("Initializing launch inspector");
        let cupti = api.as_ref();
        let subscriber = cupti
            .subscribe(Some(launch_callback))
            .map_err(|s| cupti_error(cupti, "cuptiSubscribe", s))?;
        cupti
            .enable_domain(subscriber, sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API)
            .map_err(|s| cupti_error(cupti, "cuptiEnableDomain", s))?;
        info!("Launch inspector initialized");
        Ok(Self {
            api,
            subscriber: Mutex::new(Some(subscriber)),
        })
    }

    /// Current subscription, `None` after shutdown
    pub fn subscriber(&self) -> Option<SubscriberHandle> {
        *self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launches reported so far, process-wide
    pub fn launches_seen() -> u64 {
        LAUNCHES_SEEN.load(Ordering::Relaxed)
    }

    /// Unsubscribe from CUPTI. Later calls do nothing.
    pub fn shutdown(&self) {
        let taken = self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(subscriber) = taken else {
            return;
        };
        if let Err(status) = self.api.unsubscribe(subscriber) {
            warn!("cuptiUnsubscribe failed: {}", self.api.result_string(status));
        }
        info!(launches = Self::launches_seen(), "Launch inspector shut down");
    }
}
