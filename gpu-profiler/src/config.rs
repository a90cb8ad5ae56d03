//! Configuration for the profiler
//!
//! Everything is read from environment variables: the profiler is loaded into
//! someone else's process and has no command line of its own.

use crate::error::{ProfilerError, Result};
use cuprof_shared::utils::parse_duration;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path of the trace log (required)
pub const OUTPUT_PATH_ENV: &str = "CUPTI_MEMORY_PROFILER_OUTPUT_PATH";

/// Upper bound on the shutdown drain, e.g. "3s" or "500ms"
pub const DRAIN_TIMEOUT_ENV: &str = "CUPROF_DRAIN_TIMEOUT";

/// CUPTI shared library name or path passed to dlopen
pub const CUPTI_LIBRARY_ENV: &str = "CUPROF_CUPTI_LIBRARY";

/// Set to 0/false/off to skip Python stack capture
pub const CAPTURE_PYTHON_ENV: &str = "CUPROF_CAPTURE_PYTHON";

/// tracing filter directive for the profiler's own diagnostics
pub const LOG_FILTER_ENV: &str = "CUPROF_LOG";

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_DRAIN_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_CUPTI_LIBRARY: &str = "libcupti.so";

/// Profiler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Output path for the trace log (None = not configured, which is fatal)
    pub output_path: Option<PathBuf>,

    /// How long shutdown waits for in-flight activity buffers after the flush
    pub drain_timeout: Duration,

    /// CUPTI library to load
    pub cupti_library: String,

    /// Whether to attempt Python stack capture at all
    pub capture_python: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_path: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            cupti_library: DEFAULT_CUPTI_LIBRARY.to_string(),
            capture_python: true,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config {
            output_path: lookup(OUTPUT_PATH_ENV)
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            ..Config::default()
        };

        if let Some(raw) = lookup(DRAIN_TIMEOUT_ENV) {
            config.drain_timeout = parse_duration(&raw)
                .map_err(|e| ProfilerError::InvalidConfig(format!("{}: {}", DRAIN_TIMEOUT_ENV, e)))?;
        }

        if let Some(lib) = lookup(CUPTI_LIBRARY_ENV).filter(|l| !l.trim().is_empty()) {
            config.cupti_library = lib;
        }

        if let Some(raw) = lookup(CAPTURE_PYTHON_ENV) {
            config.capture_python = parse_flag(&raw).ok_or_else(|| {
                ProfilerError::InvalidConfig(format!(
                    "{}: expected a boolean, got {:?}",
                    CAPTURE_PYTHON_ENV, raw
                ))
            })?;
        }

        Ok(config)
    }

    /// The configured output path, or the fatal misconfiguration error.
    pub fn require_output_path(&self) -> Result<&Path> {
        self.output_path
            .as_deref()
            .ok_or(ProfilerError::MissingOutputPath(OUTPUT_PATH_ENV))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.require_output_path()?;

        if self.drain_timeout > MAX_DRAIN_TIMEOUT {
            return Err(ProfilerError::InvalidConfig(format!(
                "drain timeout too long ({:?}, max {:?})",
                self.drain_timeout, MAX_DRAIN_TIMEOUT
            )));
        }

        if self.cupti_library.trim().is_empty() {
            return Err(ProfilerError::InvalidConfig(
                "CUPTI library name is empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
