//! Event sink
//!
//! Single serialization point for the trace log. Interception callbacks and
//! activity buffer completions run concurrently on many threads; every line is
//! written while holding the sink mutex so lines never interleave.

use crate::error::{exit_process, FatalHandler, ProfilerError, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Where trace lines end up.
pub trait LogDestination: Send {
    /// Prepare the destination; called once, before the first line.
    fn open(&mut self) -> Result<()>;

    /// Append one line (without its terminator).
    fn write_line(&mut self, line: &str) -> std::io::Result<()>;

    /// Flush and release the destination.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Trace log file, truncated on open
pub struct FileDestination {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl FileDestination {
    /// `path = None` models a missing configuration and fails on open.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, writer: None }
    }
}

impl LogDestination for FileDestination {
    fn open(&mut self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or(ProfilerError::MissingOutputPath(crate::config::OUTPUT_PATH_ENV))?;

        let file = File::create(path).map_err(|source| ProfilerError::OpenOutput {
            path: path.display().to_string(),
            source,
        })?;
        info!("Writing trace to {}", path.display());
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "trace file not open",
            ));
        };
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        // A crash must not lose lines already handed to us.
        writer.flush()
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// In-memory destination; clones share the same lines.
#[derive(Clone, Default)]
pub struct MemoryDestination {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    pub fn lines(&self) -> Vec<String> {
        lock(&self.lines).clone()
    }
}

impl LogDestination for MemoryDestination {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        lock(&self.lines).push(line.to_string());
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Pending,
    Open,
    Closed,
}

struct Inner {
    state: SinkState,
    destination: Box<dyn LogDestination>,
}

/// Sink counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub lines_written: u64,
    pub write_errors: u64,
    pub dropped_after_close: u64,
}

/// Thread-safe writer in front of a [`LogDestination`].
///
/// Opened lazily on first use, closed once. A closed sink never reopens:
/// later writes are dropped and counted.
pub struct EventSink {
    inner: Mutex<Inner>,
    fatal: FatalHandler,
    lines_written: AtomicU64,
    write_errors: AtomicU64,
    dropped_after_close: AtomicU64,
}

impl EventSink {
    pub fn new(destination: Box<dyn LogDestination>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SinkState::Pending,
                destination,
            }),
            fatal: exit_process,
            lines_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            dropped_after_close: AtomicU64::new(0),
        }
    }

    /// Replace the handler invoked when the destination cannot be opened.
    pub fn with_fatal_handler(mut self, fatal: FatalHandler) -> Self {
        self.fatal = fatal;
        self
    }

    /// Run `write` with exclusive access to the open destination.
    ///
    /// The lock is held for the whole closure. Returns `None` when the sink
    /// was already closed and `write` did not run.
    pub fn with_log<R>(&self, write: impl FnOnce(&mut dyn LogDestination) -> R) -> Option<R> {
        let mut inner = lock(&self.inner);
        let state = inner.state;
        match state {
            SinkState::Open => {}
            SinkState::Pending => {
                let opened = inner.destination.open();
                if let Err(e) = opened {
                    drop(inner);
                    (self.fatal)(&e);
                }
                inner.state = SinkState::Open;
            }
            SinkState::Closed => {
                self.dropped_after_close.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        Some(write(inner.destination.as_mut()))
    }

    /// Write one line, absorbing I/O errors.
    pub fn write_line(&self, line: &str) {
        self.emit(&line)
    }

    /// Format `record` and write it as one line. Formatting happens under the
    /// lock, after any expensive preparation the caller did.
    pub fn emit<T: fmt::Display + ?Sized>(&self, record: &T) {
        let result = self.with_log(|dest| dest.write_line(&record.to_string()));
        match result {
            Some(Ok(())) => {
                self.lines_written.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(e)) => {
                self.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to write trace line: {}", e);
            }
            None => {}
        }
    }

    /// Flush and close the destination. Only the first call has any effect.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        let previous = inner.state;
        if previous == SinkState::Closed {
            return;
        }
        inner.state = SinkState::Closed;
        if previous == SinkState::Pending {
            debug!("Closing trace sink that was never opened");
            return;
        }
        if let Err(e) = inner.destination.close() {
            warn!("Failed to close trace output: {}", e);
        }
        info!(
            lines = self.lines_written.load(Ordering::Relaxed),
            "Trace sink closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).state == SinkState::Closed
    }

    pub fn stats(&self) -> SinkStats {
        SinkStats {
            lines_written: self.lines_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            dropped_after_close: self.dropped_after_close.load(Ordering::Relaxed),
        }
    }
}

/// Lock, recovering from poisoning.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
