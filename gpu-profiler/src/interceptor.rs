//! Synchronous interception of CUDA runtime and driver API calls

use crate::cupti::{callback_domain, cbid, sys, CallbackInfo, CuptiApi};
use crate::sink::EventSink;
use crate::stack::StackCapturer;
use cuprof_shared::utils::time::system_time_nanos;
use cuprof_shared::{CallbackRecord, CallbackSite};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sys::CUpti_CallbackDomain::{CUPTI_CB_DOMAIN_DRIVER_API, CUPTI_CB_DOMAIN_RUNTIME_API};

/// Calls worth a stack capture: (domain, callback id, name).
pub const TRACKED_OPERATIONS: &[(sys::CUpti_CallbackDomain, u32, &str)] = &[
    (CUPTI_CB_DOMAIN_RUNTIME_API, cbid::CUDA_MALLOC, "cudaMalloc"),
    (CUPTI_CB_DOMAIN_RUNTIME_API, cbid::CUDA_FREE, "cudaFree"),
    (CUPTI_CB_DOMAIN_RUNTIME_API, cbid::CUDA_MALLOC_MANAGED, "cudaMallocManaged"),
    (CUPTI_CB_DOMAIN_DRIVER_API, cbid::CU_MEM_CREATE, "cuMemCreate"),
    (CUPTI_CB_DOMAIN_DRIVER_API, cbid::CU_MEM_RELEASE, "cuMemRelease"),
    (CUPTI_CB_DOMAIN_DRIVER_API, cbid::CU_MEM_SET_ACCESS, "cuMemSetAccess"),
];

/// Name of a tracked call, `None` for everything else.
pub fn tracked_operation(domain: sys::CUpti_CallbackDomain, cbid: u32) -> Option<&'static str> {
    TRACKED_OPERATIONS
        .iter()
        .find(|(d, c, _)| *d == domain && *c == cbid)
        .map(|(_, _, name)| *name)
}

/// Turns CUPTI API callbacks into `CALLBACK` trace lines.
pub struct Interceptor {
    sink: Arc<EventSink>,
    stacks: Arc<dyn StackCapturer>,
    api: Arc<dyn CuptiApi>,
    callbacks_seen: AtomicU64,
}

impl Interceptor {
    pub fn new(sink: Arc<EventSink>, stacks: Arc<dyn StackCapturer>, api: Arc<dyn CuptiApi>) -> Self {
        Self {
            sink,
            stacks,
            api,
            callbacks_seen: AtomicU64::new(0),
        }
    }

    /// Handle one ENTER or EXIT notification.
    ///
    /// Runs on the application thread making the CUDA call.
    pub fn on_callback(&self, domain: sys::CUpti_CallbackDomain, cbid: u32, info: &CallbackInfo<'_>) {
        self.callbacks_seen.fetch_add(1, Ordering::Relaxed);

        let timestamp = self.api.timestamp().unwrap_or_else(system_time_nanos);
        let api_name = tracked_operation(domain, cbid);

        let mut record = CallbackRecord {
            correlation_id: info.correlation_id,
            domain: callback_domain(domain),
            cbid,
            site: info.site,
            timestamp,
            api_name: api_name.map(str::to_string),
            native_stack: None,
            python_stack: None,
        };

        // Stacks are walked before the sink lock is taken.
        if api_name.is_some() && info.site == CallbackSite::Enter {
            record.native_stack = Some(self.stacks.native_stack());
            record.python_stack = Some(self.stacks.interpreted_stack());
        }

        self.sink.emit(&record);
    }

    pub fn callbacks_seen(&self) -> u64 {
        self.callbacks_seen.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_table() {
        assert_eq!(
            tracked_operation(CUPTI_CB_DOMAIN_RUNTIME_API, cbid::CUDA_MALLOC),
            Some("cudaMalloc")
        );
        assert_eq!(
            tracked_operation(CUPTI_CB_DOMAIN_DRIVER_API, cbid::CU_MEM_RELEASE),
            Some("cuMemRelease")
        );
        // Same id in the other domain is a different call.
        assert_eq!(tracked_operation(CUPTI_CB_DOMAIN_DRIVER_API, cbid::CUDA_MALLOC), None);
        assert_eq!(
            tracked_operation(CUPTI_CB_DOMAIN_RUNTIME_API, cbid::CU_LAUNCH_KERNEL),
            None
        );
        assert_eq!(tracked_operation(CUPTI_CB_DOMAIN_DRIVER_API, cbid::CU_LAUNCH_KERNEL_EX), None);
    }

    #[test]
    fn test_table_has_no_duplicates() {
        for (i, (d, c, _)) in TRACKED_OPERATIONS.iter().enumerate() {
            assert!(TRACKED_OPERATIONS[i + 1..]
                .iter()
                .all(|(d2, c2, _)| (d, c) != (d2, c2)));
        }
    }
}
