//! Native stack capture via the `backtrace` crate

use super::STACK_UNAVAILABLE;
use cuprof_shared::protocol::line::{Flat, NEWLINE_TOKEN};
use std::ffi::c_void;
use std::fmt::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Deepest stack we render; deeper frames are cut off.
const MAX_FRAMES: usize = 128;

/// Walk and symbolize the current thread's stack.
///
/// One entry per frame, `#<n> <ip> <symbol> at <file>:<line>`, joined with
/// [`NEWLINE_TOKEN`]. Inlined functions share their caller's frame number.
/// Missing symbol information degrades to `<unknown>`.
pub fn capture_native_stack() -> String {
    catch_unwind(AssertUnwindSafe(|| {
        let mut ips: Vec<usize> = Vec::with_capacity(32);
        backtrace::trace(|frame| {
            ips.push(frame.ip() as usize);
            ips.len() < MAX_FRAMES
        });
        render_frames(&ips)
    }))
    .ok()
    .filter(|s| !s.is_empty())
    .unwrap_or_else(|| STACK_UNAVAILABLE.to_string())
}

fn render_frames(ips: &[usize]) -> String {
    let mut out = String::with_capacity(ips.len() * 96);

    for (index, &ip) in ips.iter().enumerate() {
        let mut resolved = false;
        backtrace::resolve(ip as *mut c_void, |symbol| {
            resolved = true;
            push_separator(&mut out);
            let _ = write!(out, "#{} {:#x} ", index, ip);
            match symbol.name() {
                Some(name) => {
                    let _ = write!(out, "{}", Flat(&name.to_string()));
                }
                None => out.push_str("<unknown>"),
            }
            if let Some(file) = symbol.filename() {
                let _ = write!(out, " at {}", Flat(&file.display().to_string()));
                if let Some(line) = symbol.lineno() {
                    let _ = write!(out, ":{}", line);
                }
            }
        });

        if !resolved {
            push_separator(&mut out);
            let _ = write!(out, "#{} {:#x} <unknown>", index, ip);
        }
    }

    out
}

fn push_separator(out: &mut String) {
    if !out.is_empty() {
        out.push_str(NEWLINE_TOKEN);
    }
}
