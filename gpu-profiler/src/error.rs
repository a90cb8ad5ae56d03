//! Error types for the profiler

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfilerError {
    #[error("output path not configured (set {0})")]
    MissingOutputPath(&'static str),

    #[error("failed to open output file {path}: {source}")]
    OpenOutput {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load {library}: {message}")]
    LibraryLoad { library: String, message: String },

    #[error("CUPTI call {call} failed with status {status}: {message}")]
    Cupti {
        call: &'static str,
        status: u32,
        message: String,
    },

    #[error("profiler already initialized in this process")]
    AlreadyInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T, E = ProfilerError> = std::result::Result<T, E>;

/// Terminates the process after a fatal error.
///
/// A partially-enabled profiler yields misleading data, so there is no degraded
/// mode: report loudly and exit.
pub type FatalHandler = fn(&ProfilerError) -> !;

/// Default [`FatalHandler`]: log, echo to stderr and exit with status 1.
pub fn exit_process(err: &ProfilerError) -> ! {
    tracing::error!("fatal: {}", err);
    eprintln!("[cuprof] fatal: {}", err);
    std::process::exit(1)
}
