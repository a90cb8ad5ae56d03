//! Profiler lifecycle: wiring CUPTI up at init, draining it at shutdown

use crate::activity::{ActivityCollector, CollectorStats};
use crate::config::Config;
use crate::cupti::{cupti_error, sys, CuptiApi, SubscriberHandle};
use crate::error::{exit_process, FatalHandler, Result};
use crate::hooks;
use crate::interceptor::Interceptor;
use crate::sink::{EventSink, SinkStats};
use crate::stack::StackCapturer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything the CUPTI trampolines dispatch to
pub struct Pipeline {
    pub sink: Arc<EventSink>,
    pub interceptor: Interceptor,
    pub collector: ActivityCollector,
}

impl Pipeline {
    pub fn new(api: Arc<dyn CuptiApi>, sink: Arc<EventSink>, stacks: Arc<dyn StackCapturer>) -> Self {
        Self {
            interceptor: Interceptor::new(Arc::clone(&sink), stacks, Arc::clone(&api)),
            collector: ActivityCollector::new(api, Arc::clone(&sink)),
            sink,
        }
    }
}

/// What shutdown observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every buffer came back before the drain timeout
    pub drained: bool,
    /// Buffers still outstanding when the drain gave up
    pub outstanding: usize,
    pub collector: CollectorStats,
    pub sink: SinkStats,
}

/// The memory profiler.
///
/// `init` turns tracing on; `shutdown` flushes CUPTI, waits for outstanding
/// buffers and closes the trace. Both are meant to be called once; extra
/// `shutdown` calls are no-ops.
pub struct Profiler {
    config: Config,
    api: Arc<dyn CuptiApi>,
    pipeline: Arc<Pipeline>,
    fatal: FatalHandler,
    subscriber: Mutex<Option<SubscriberHandle>>,
    shut_down: AtomicBool,
}

impl Profiler {
    pub fn new(
        config: Config,
        api: Arc<dyn CuptiApi>,
        sink: Arc<EventSink>,
        stacks: Arc<dyn StackCapturer>,
    ) -> Self {
        let pipeline = Arc::new(Pipeline::new(Arc::clone(&api), sink, stacks));
        Self {
            config,
            api,
            pipeline,
            fatal: exit_process,
            subscriber: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Enable tracing. Any failure terminates through the fatal handler.
    pub fn init(&self) {
        if let Err(e) = self.try_init() {
            (self.fatal)(&e);
        }
    }

    /// Enable tracing, reporting the first failing step.
    ///
    /// Steps already taken are not rolled back; callers treat an error as fatal.
    pub fn try_init(&self) -> Result<()> {
        info!("Initializing CUDA memory profiler");
        let api = self.api.as_ref();

        hooks::install(Arc::clone(&self.pipeline))?;

        api.activity_enable(sys::CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MEMORY2)
            .map_err(|s| cupti_error(api, "cuptiActivityEnable", s))?;

        api.register_buffer_callbacks(Some(hooks::buffer_requested), Some(hooks::buffer_completed))
            .map_err(|s| cupti_error(api, "cuptiActivityRegisterCallbacks", s))?;

        let subscriber = api
            .subscribe(Some(hooks::api_callback))
            .map_err(|s| cupti_error(api, "cuptiSubscribe", s))?;
        *self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(subscriber);

        for domain in [
            sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API,
            sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_RUNTIME_API,
        ] {
            api.enable_domain(subscriber, domain)
                .map_err(|s| cupti_error(api, "cuptiEnableDomain", s))?;
            debug!(?domain, "Callback domain enabled");
        }

        info!("CUDA memory profiler initialized");
        Ok(())
    }

    /// Flush, drain and close. Returns `None` if shutdown already ran.
    pub fn shutdown(&self) -> Option<ShutdownReport> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Profiler already shut down");
            return None;
        }
        info!("Shutting down CUDA memory profiler");

        // Forced: also hand back partially filled buffers.
        let forced = sys::CUpti_ActivityFlag::CUPTI_ACTIVITY_FLAG_FLUSH_FORCED as u32;
        if let Err(status) = self.api.flush_all(forced) {
            warn!(
                "cuptiActivityFlushAll failed: {}",
                self.api.result_string(status)
            );
        }

        let collector = &self.pipeline.collector;
        let started = Instant::now();
        let drained = collector.wait_idle(self.config.drain_timeout);
        let outstanding = collector.in_flight();
        if drained {
            debug!(elapsed = ?started.elapsed(), "Activity buffers drained");
        } else {
            warn!(
                "{} activity buffer(s) still outstanding after {:?}; records they hold may be lost",
                outstanding, self.config.drain_timeout
            );
        }

        self.pipeline.sink.close();

        let report = ShutdownReport {
            drained,
            outstanding,
            collector: collector.stats(),
            sink: self.pipeline.sink.stats(),
        };
        info!(
            buffers = report.collector.buffers_released,
            records = report.collector.records_emitted,
            lines = report.sink.lines_written,
            "CUDA memory profiler shut down"
        );
        Some(report)
    }

    /// Handle returned by `cuptiSubscribe`, once `init` got that far
    pub fn subscriber(&self) -> Option<SubscriberHandle> {
        *self
            .subscriber
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
