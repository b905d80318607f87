//! Bounded call-stack capture.
//!
//! Capture is treated as an opaque primitive: it returns an ordered list of
//! return addresses, innermost first, with the engine's own frames and the
//! runtime's entry frames filtered out. A thread-local reentrancy flag is
//! raised for the duration of a capture so that the event hooks never record
//! the engine's own internal lock use.

use std::cell::Cell;

thread_local! {
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside a call-stack capture.
///
/// Checked at every hook entry point; while set, lock events pass straight
/// through to the raw primitive without being recorded.
pub fn in_capture() -> bool {
    IN_CAPTURE.with(|f| f.get())
}

// Frames at or below these belong to the runtime's bootstrap; unwinding
// stops when one is reached so captured stacks end at the program entry.
const ENTRY_MARKERS: &[&str] = &[
    "__rust_begin_short_backtrace",
    "lang_start",
    "__libc_start_main",
    "thread_start",
];

fn symbol_name(ip: *mut std::ffi::c_void) -> Option<String> {
    let mut name = None;
    backtrace::resolve(ip, |symbol| {
        if name.is_none() {
            name = symbol.name().map(|n| n.to_string());
        }
    });
    name
}

fn is_engine_frame(name: &str) -> bool {
    name.contains("locksentry::") || name.starts_with("backtrace::")
}

fn is_entry_frame(name: &str) -> bool {
    ENTRY_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Capture up to `max` return addresses of the current call stack.
///
/// Leading engine frames are skipped and the walk is truncated at the first
/// runtime entry frame. Frames that cannot be resolved to a symbol are kept:
/// they are stable within one binary, which is all trie matching needs.
pub fn capture(max: usize) -> Vec<usize> {
    let mut frames = Vec::with_capacity(max);
    let mut skipping = true;

    IN_CAPTURE.with(|f| f.set(true));
    backtrace::trace(|frame| {
        let ip = frame.ip();
        let name = symbol_name(ip);

        if skipping {
            match &name {
                Some(n) if is_engine_frame(n) => return true,
                _ => skipping = false,
            }
        }
        if let Some(n) = &name {
            if is_entry_frame(n) {
                return false;
            }
        }
        frames.push(ip as usize);
        frames.len() < max
    });
    IN_CAPTURE.with(|f| f.set(false));

    frames
}

/// Resolve an instruction address to a `symbol (file:line)` annotation.
///
/// Returns `None` when no symbol information is available; callers omit the
/// annotation in that case.
#[cfg_attr(not(feature = "report-file"), allow(dead_code))]
pub fn resolve_annotation(addr: usize) -> Option<String> {
    let mut out = None;
    backtrace::resolve(addr as *mut std::ffi::c_void, |symbol| {
        if out.is_some() {
            return;
        }
        let name = symbol.name().map(|n| n.to_string());
        let line = match (symbol.filename(), symbol.lineno()) {
            (Some(file), Some(no)) => Some(format!("{}:{}", file.display(), no)),
            _ => None,
        };
        out = match (name, line) {
            (Some(n), Some(l)) => Some(format!("{n} ({l})")),
            (Some(n), None) => Some(n),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        };
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_clears_reentrancy_flag() {
        assert!(!in_capture());
        let _ = capture(4);
        assert!(!in_capture());
    }

    #[test]
    fn test_capture_is_bounded() {
        let frames = capture(3);
        assert!(frames.len() <= 3);
    }
}
