//! In-process stand-ins for CUPTI and the stack capturer.

#![allow(dead_code)]

use cuprof_gpu::cupti::{
    sys, CuptiApi, CuptiStatus, NextRecord, RawActivity, RawMemoryActivity, RecordCursor,
    SubscriberHandle,
};
use cuprof_gpu::stack::{Capabilities, StackCapturer};
use cuprof_shared::LogLine;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub use sys::CUpti_ActivityMemoryKind as MemKind;
pub use sys::CUpti_ActivityMemoryOperationType as MemOp;

pub const ALLOC: MemOp = MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_ALLOCATION;
pub const FREE: MemOp = MemOp::CUPTI_ACTIVITY_MEMORY_OPERATION_TYPE_RELEASE;
pub const DEVICE: MemKind = MemKind::CUPTI_ACTIVITY_MEMORY_KIND_DEVICE;
pub const PINNED: MemKind = MemKind::CUPTI_ACTIVITY_MEMORY_KIND_PINNED;
pub const MANAGED: MemKind = MemKind::CUPTI_ACTIVITY_MEMORY_KIND_MANAGED;

pub const MEMORY2: u32 = sys::CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MEMORY2 as u32;

/// Record kind the fake decoder rejects
pub const CORRUPT_KIND: u32 = 0xdead;

/// Record kind that is neither memory nor corrupt
pub const KERNEL_KIND: u32 = sys::CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_CONCURRENT_KERNEL as u32;

/// Size of one encoded fake record: kind, padding, then the fields in memory order
pub const RECORD_SIZE: usize = (8 + size_of::<RawMemoryActivity>() + 7) / 8 * 8;

/// Write `records` into `buffer` back to back; returns the valid size.
pub fn encode(buffer: &mut [u8], records: &[(u32, RawMemoryActivity)]) -> usize {
    let mut offset = 0;
    for (kind, raw) in records {
        let out = &mut buffer[offset..offset + RECORD_SIZE];
        out[0..4].copy_from_slice(&kind.to_le_bytes());
        unsafe { std::ptr::write_unaligned(out[8..].as_mut_ptr() as *mut RawMemoryActivity, *raw) };
        offset += RECORD_SIZE;
    }
    offset
}

pub fn memory(op: MemOp, kind: MemKind, correlation_id: u32, address: u64, bytes: u64) -> (u32, RawMemoryActivity) {
    (
        MEMORY2,
        RawMemoryActivity {
            memory_operation_type: op,
            memory_kind: kind,
            correlation_id,
            address,
            bytes,
            timestamp: 1_000 + correlation_id as u64,
            device_id: 0,
            context_id: 1,
            stream_id: 7,
        },
    )
}

pub fn corrupt() -> (u32, RawMemoryActivity) {
    let (_, raw) = memory(ALLOC, DEVICE, 0, 0, 0);
    (CORRUPT_KIND, raw)
}

pub fn kernel() -> (u32, RawMemoryActivity) {
    let (_, raw) = memory(ALLOC, DEVICE, 0, 0, 0);
    (KERNEL_KIND, raw)
}

/// CUPTI stand-in that records what the profiler asked of it.
#[derive(Default)]
pub struct FakeCupti {
    pub enabled_kinds: Mutex<Vec<sys::CUpti_ActivityKind>>,
    pub enabled_domains: Mutex<Vec<sys::CUpti_CallbackDomain>>,
    pub buffer_callbacks: Mutex<
        Option<(sys::CUpti_BuffersCallbackRequestFunc, sys::CUpti_BuffersCallbackCompleteFunc)>,
    >,
    pub api_callback: Mutex<sys::CUpti_CallbackFunc>,
    pub unsubscribed: Mutex<Vec<SubscriberHandle>>,
    pub flushes: AtomicU64,
    pub clock: AtomicU64,
    /// Name of a call that should fail with `CUPTI_ERROR_UNKNOWN`
    pub fail_call: Mutex<Option<&'static str>>,
    /// Buffers obtained through the registered request callback, handed back on flush
    pub lent: Mutex<Vec<(usize, usize, usize)>>,
}

impl FakeCupti {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(call: &'static str) -> Self {
        let fake = Self::default();
        *fake.fail_call.lock().unwrap() = Some(call);
        fake
    }

    fn check(&self, call: &str) -> Result<(), CuptiStatus> {
        match *self.fail_call.lock().unwrap() {
            Some(failing) if failing == call => {
                Err(CuptiStatus(sys::CUptiResult::CUPTI_ERROR_UNKNOWN))
            }
            _ => Ok(()),
        }
    }

    /// Ask for a buffer the way CUPTI would, fill it with `records` and keep
    /// it until the next flush.
    pub fn lend_buffer(&self, records: &[(u32, RawMemoryActivity)]) {
        let (requested, _) = self.buffer_callbacks.lock().unwrap().expect("callbacks registered");
        let requested = requested.expect("request callback");
        let mut ptr: *mut u8 = std::ptr::null_mut();
        let mut size = 0usize;
        let mut max = 0usize;
        unsafe { requested(&mut ptr, &mut size, &mut max) };
        assert!(!ptr.is_null());

        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr, size) };
        let valid = encode(bytes, records);
        self.lent.lock().unwrap().push((ptr as usize, size, valid));
    }

    /// Invoke the registered API callback with a synthesized `CUpti_CallbackData`.
    pub fn fire_callback(
        &self,
        domain: sys::CUpti_CallbackDomain,
        cbid: u32,
        site: sys::CUpti_ApiCallbackSite,
        correlation_id: u32,
    ) {
        let callback = self.api_callback.lock().unwrap().expect("subscribed");
        let mut data: sys::CUpti_CallbackData = unsafe { std::mem::zeroed() };
        data.callbackSite = site;
        data.functionName = b"fake\0".as_ptr() as *const std::ffi::c_char;
        data.correlationId = correlation_id;
        unsafe {
            callback(
                std::ptr::null_mut(),
                domain,
                cbid,
                &data as *const sys::CUpti_CallbackData as *const std::ffi::c_void,
            )
        };
    }
}

impl CuptiApi for FakeCupti {
    fn activity_enable(&self, kind: sys::CUpti_ActivityKind) -> Result<(), CuptiStatus> {
        self.check("cuptiActivityEnable")?;
        self.enabled_kinds.lock().unwrap().push(kind);
        Ok(())
    }

    fn register_buffer_callbacks(
        &self,
        requested: sys::CUpti_BuffersCallbackRequestFunc,
        completed: sys::CUpti_BuffersCallbackCompleteFunc,
    ) -> Result<(), CuptiStatus> {
        self.check("cuptiActivityRegisterCallbacks")?;
        *self.buffer_callbacks.lock().unwrap() = Some((requested, completed));
        Ok(())
    }

    fn subscribe(&self, callback: sys::CUpti_CallbackFunc) -> Result<SubscriberHandle, CuptiStatus> {
        self.check("cuptiSubscribe")?;
        *self.api_callback.lock().unwrap() = callback;
        Ok(SubscriberHandle(0x5eed))
    }

    fn unsubscribe(&self, subscriber: SubscriberHandle) -> Result<(), CuptiStatus> {
        self.check("cuptiUnsubscribe")?;
        self.unsubscribed.lock().unwrap().push(subscriber);
        Ok(())
    }

    fn enable_domain(
        &self,
        subscriber: SubscriberHandle,
        domain: sys::CUpti_CallbackDomain,
    ) -> Result<(), CuptiStatus> {
        self.check("cuptiEnableDomain")?;
        assert_eq!(subscriber, SubscriberHandle(0x5eed));
        self.enabled_domains.lock().unwrap().push(domain);
        Ok(())
    }

    fn flush_all(&self, _flag: u32) -> Result<(), CuptiStatus> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let lent: Vec<_> = self.lent.lock().unwrap().drain(..).collect();
        let Some((_, Some(completed))) = *self.buffer_callbacks.lock().unwrap() else {
            return Ok(());
        };
        // CUPTI delivers completions on its own thread.
        std::thread::spawn(move || {
            for (ptr, size, valid) in lent {
                unsafe { completed(std::ptr::null_mut(), 0, ptr as *mut u8, size, valid) };
            }
        });
        Ok(())
    }

    fn next_record(&self, buffer: &[u8], cursor: &mut RecordCursor) -> NextRecord {
        let offset = cursor.offset().map_or(0, |o| o + RECORD_SIZE);
        if offset + RECORD_SIZE > buffer.len() {
            return NextRecord::EndOfBuffer;
        }
        let bytes = &buffer[offset..offset + RECORD_SIZE];
        let kind = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if kind == CORRUPT_KIND {
            return NextRecord::Error(CuptiStatus(sys::CUptiResult::CUPTI_ERROR_INVALID_PARAMETER));
        }
        cursor.advance_to(offset);
        if kind != MEMORY2 {
            return NextRecord::Record(RawActivity::Other { kind });
        }
        let raw = unsafe { std::ptr::read_unaligned(bytes[8..].as_ptr() as *const RawMemoryActivity) };
        NextRecord::Record(RawActivity::Memory(raw))
    }

    fn timestamp(&self) -> Option<u64> {
        Some(self.clock.fetch_add(10, Ordering::SeqCst) + 10)
    }

    fn result_string(&self, status: CuptiStatus) -> String {
        format!("fake status {}", status.0 as u32)
    }
}

/// Stack capturer with canned multi-line stacks
pub struct FixedStacks;

pub const NATIVE_STACK: &str = "#0 0x1 alloc_tensor\n#1 0x2 main";
pub const PYTHON_STACK: &str = "  File \"train.py\", line 3, in <module>\n    x = torch.empty(4)\n";

impl StackCapturer for FixedStacks {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native: true,
            interpreted: true,
        }
    }

    fn native_stack(&self) -> String {
        NATIVE_STACK.to_string()
    }

    fn interpreted_stack(&self) -> String {
        PYTHON_STACK.to_string()
    }
}

pub fn parse_all(lines: &[String]) -> Vec<LogLine> {
    lines
        .iter()
        .map(|l| LogLine::parse(l).expect("well-formed line"))
        .collect()
}
