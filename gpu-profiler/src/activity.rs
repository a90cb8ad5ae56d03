//! Asynchronous activity collection
//!
//! CUPTI asks for empty buffers, fills them with activity records on its own
//! schedule and hands them back on one of its threads. Each completed buffer is
//! decoded here, memory records become `ACTIVITY_MEMORY` lines, and the buffer
//! is freed.

use crate::cupti::{
    memory_kind, memory_operation, CuptiApi, NextRecord, RawActivity, RawMemoryActivity,
    RecordCursor,
};
use crate::sink::EventSink;
use cuprof_shared::MemoryActivityRecord;
use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

/// Size of every buffer handed to CUPTI
pub const ACTIVITY_BUFFER_SIZE: usize = 16 * 1024;

/// CUPTI requires 8-byte aligned activity buffers
pub const ACTIVITY_BUFFER_ALIGN: usize = 8;

/// Heap block lent to CUPTI for activity records; freed on drop.
pub struct ActivityBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The buffer is plain bytes with a single owner.
unsafe impl Send for ActivityBuffer {}

impl ActivityBuffer {
    /// Allocate a zeroed buffer of [`ACTIVITY_BUFFER_SIZE`] bytes.
    pub fn allocate() -> Option<Self> {
        let layout = Layout::from_size_align(ACTIVITY_BUFFER_SIZE, ACTIVITY_BUFFER_ALIGN).ok()?;
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self {
            ptr,
            len: ACTIVITY_BUFFER_SIZE,
        })
    }

    /// Give up ownership, e.g. to CUPTI. Must come back through [`Self::from_raw`].
    pub fn into_raw(self) -> (*mut u8, usize) {
        let raw = (self.ptr.as_ptr(), self.len);
        std::mem::forget(self);
        raw
    }

    /// Take back a buffer produced by [`Self::into_raw`].
    ///
    /// # Safety
    /// `ptr` and `len` must come from `into_raw` and the buffer must not have
    /// been reclaimed already.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ActivityBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Layout::from_size_align(self.len, ACTIVITY_BUFFER_ALIGN) {
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) }
        }
    }
}

/// Collector counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub buffers_requested: u64,
    pub buffers_released: u64,
    pub records_emitted: u64,
    pub records_skipped: u64,
    pub decode_errors: u64,
}

/// Decodes completed activity buffers into the sink.
pub struct ActivityCollector {
    api: Arc<dyn CuptiApi>,
    sink: Arc<EventSink>,
    buffers_requested: AtomicU64,
    buffers_released: AtomicU64,
    records_emitted: AtomicU64,
    records_skipped: AtomicU64,
    decode_errors: AtomicU64,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

impl ActivityCollector {
    pub fn new(api: Arc<dyn CuptiApi>, sink: Arc<EventSink>) -> Self {
        Self {
            api,
            sink,
            buffers_requested: AtomicU64::new(0),
            buffers_released: AtomicU64::new(0),
            records_emitted: AtomicU64::new(0),
            records_skipped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Hand out a fresh buffer. `None` when allocation fails, in which case
    /// CUPTI drops the records it wanted to store.
    pub fn request_buffer(&self) -> Option<ActivityBuffer> {
        let Some(buffer) = ActivityBuffer::allocate() else {
            error!("Failed to allocate {} byte activity buffer", ACTIVITY_BUFFER_SIZE);
            return None;
        };
        self.buffers_requested.fetch_add(1, Ordering::Relaxed);
        *lock(&self.in_flight) += 1;
        trace!("Activity buffer requested");
        Some(buffer)
    }

    /// Decode the first `valid_size` bytes of a completed buffer, then free it.
    pub fn complete_buffer(&self, buffer: ActivityBuffer, valid_size: usize) {
        let _release = Release(self);
        // Rebound after `_release` so the buffer is freed before waiters wake.
        let buffer = buffer;

        let valid = &buffer.as_slice()[..valid_size.min(buffer.len())];
        let mut cursor = RecordCursor::new();
        let mut emitted = 0u64;

        loop {
            match self.api.next_record(valid, &mut cursor) {
                NextRecord::Record(RawActivity::Memory(raw)) => {
                    self.sink.emit(&memory_record(&raw));
                    emitted += 1;
                }
                NextRecord::Record(RawActivity::Other { kind }) => {
                    trace!(kind, "Skipping activity record");
                    self.records_skipped.fetch_add(1, Ordering::Relaxed);
                }
                NextRecord::EndOfBuffer => break,
                NextRecord::Error(status) => {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Failed to decode activity buffer after {} records: {}",
                        emitted,
                        self.api.result_string(status)
                    );
                    break;
                }
            }
        }

        self.records_emitted.fetch_add(emitted, Ordering::Relaxed);
        debug!(records = emitted, bytes = valid.len(), "Activity buffer processed");
    }

    /// Buffers currently lent out or being decoded
    pub fn in_flight(&self) -> usize {
        *lock(&self.in_flight)
    }

    /// Block until no buffer is in flight or `timeout` passes. Returns whether
    /// the collector went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_flight = lock(&self.in_flight);
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            in_flight = match self.idle.wait_timeout(in_flight, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            buffers_requested: self.buffers_requested.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

/// Marks a buffer as returned, even if decoding unwinds.
struct Release<'a>(&'a ActivityCollector);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let collector = self.0;
        collector.buffers_released.fetch_add(1, Ordering::Relaxed);
        let mut in_flight = lock(&collector.in_flight);
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            collector.idle.notify_all();
        }
    }
}

/// Map CUPTI enumerations onto the log's vocabulary.
pub fn memory_record(raw: &RawMemoryActivity) -> MemoryActivityRecord {
    MemoryActivityRecord {
        correlation_id: raw.correlation_id,
        operation: memory_operation(raw.memory_operation_type),
        kind: memory_kind(raw.memory_kind),
        timestamp: raw.timestamp,
        address: raw.address,
        size: raw.bytes,
        device_id: raw.device_id,
        context_id: raw.context_id,
        stream_id: raw.stream_id,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
