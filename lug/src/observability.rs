//! Tracing setup and script print/debug routing
//!
//! Script `print()` always goes to stdout. Script `debug()` is routed by
//! [`Mode`]: `debug` → stderr, `test` → an in-process capture buffer,
//! `release` → dropped. Background task failures (wait-group callbacks) are
//! reported through the same debug sink.

use std::io::Write;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use crate::config::Mode;

static CAPTURED: Lazy<Mutex<Vec<String>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Initialize the global tracing subscriber
///
/// Filtering follows `RUST_LOG` with an `info` default. Safe to call more
/// than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Sink for script `print()` output
pub fn script_print(text: &str) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{text}");
}

/// Sink for script `debug()` output, routed by run mode
pub fn script_debug(mode: Mode, text: &str, source: Option<&str>, line: Option<usize>) {
    let line = match (source, line) {
        (Some(src), Some(line)) => format!("[{src}:{line}] {text}"),
        (None, Some(line)) => format!("[:{line}] {text}"),
        _ => text.to_string(),
    };
    match mode {
        Mode::Debug => {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{line}");
        }
        Mode::Test => {
            if let Ok(mut buf) = CAPTURED.lock() {
                buf.push(line);
            }
        }
        Mode::Release => {}
    }
}

/// Drain the test-mode capture buffer
pub fn take_captured() -> Vec<String> {
    CAPTURED.lock().map(|mut buf| std::mem::take(&mut *buf)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_mode_captures_debug_output() {
        take_captured();
        script_debug(Mode::Test, "hello", Some("script.rhai"), Some(3));
        script_debug(Mode::Test, "world", None, None);
        let captured = take_captured();
        assert_eq!(captured, vec!["[script.rhai:3] hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn test_release_mode_drops_debug_output() {
        take_captured();
        script_debug(Mode::Release, "dropped", None, None);
        assert!(take_captured().is_empty());
    }
}
