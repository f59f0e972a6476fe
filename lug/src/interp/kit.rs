//! Module kit: execution context and argument validation
//!
//! Every script entry (CLI run, REPL line, request handler, wait-group
//! callback, transaction body) installs an [`ExecContext`] in a thread-local
//! stack for the duration of the evaluation. Host functions reach the
//! context through [`current`] to resolve the owning script's AST, the run
//! mode, and the async runtime handle used for blocking bridge calls.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use rhai::{Dynamic, EvalAltResult, FnPtr, ImmutableString, Map, Position, AST};
use tokio::runtime::Handle;

use crate::config::Mode;
use crate::error::{Error, ErrorKind};

/// A loaded script: the compiled AST shared by everyone who needs to
/// resolve its function definitions
///
/// The AST is immutable after compilation, so attaching it to a borrowed
/// interpreter gives read access to the script's "globals" without any
/// aliasing hazard.
#[derive(Clone)]
pub struct ScriptImage {
    ast: Arc<AST>,
}

impl ScriptImage {
    /// Wrap a compiled AST
    pub fn new(ast: AST) -> Self {
        Self { ast: Arc::new(ast) }
    }

    /// The compiled AST
    pub fn ast(&self) -> &AST {
        &self.ast
    }

    /// Shared handle to the compiled AST
    pub fn shared_ast(&self) -> Arc<AST> {
        self.ast.clone()
    }
}

/// Per-evaluation state visible to host functions
#[derive(Clone)]
pub struct ExecContext {
    /// The script whose callables are being evaluated
    pub image: ScriptImage,
    /// Debug-print routing mode
    pub mode: Mode,
    /// Runtime handle for blocking bridge calls
    pub handle: Handle,
}

impl ExecContext {
    /// Build a context for the given script image
    ///
    /// Captures the ambient tokio runtime handle; callers must be inside a
    /// runtime context (entered guard or blocking-task thread).
    pub fn new(image: ScriptImage, mode: Mode) -> crate::error::Result<Self> {
        let handle = Handle::try_current().map_err(|_| {
            Error::new(ErrorKind::ScriptError, "no tokio runtime available for script execution")
        })?;
        Ok(Self { image, mode, handle })
    }
}

thread_local! {
    static EXEC_STACK: RefCell<Vec<ExecContext>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard removing the installed context on drop
pub struct ExecGuard {
    _private: (),
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        EXEC_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Install an execution context on the current thread
pub fn enter(context: ExecContext) -> ExecGuard {
    EXEC_STACK.with(|stack| stack.borrow_mut().push(context));
    ExecGuard { _private: () }
}

/// The innermost execution context on this thread, if any
pub fn current() -> Option<ExecContext> {
    EXEC_STACK.with(|stack| stack.borrow().last().cloned())
}

/// The innermost execution context, or a script-visible error
pub fn require_current() -> Result<ExecContext, Box<EvalAltResult>> {
    current().ok_or_else(|| {
        Error::new(ErrorKind::ScriptError, "no active script context").into_script()
    })
}

/// Run a future to completion from a blocking (script) thread
pub fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, Box<EvalAltResult>> {
    let context = require_current()?;
    Ok(context.handle.block_on(future))
}

/// Build a script-visible runtime error carrying a stable kind tag
pub fn runtime_error(kind: ErrorKind, message: impl Into<String>) -> Box<EvalAltResult> {
    Error::new(kind, message).into_script()
}

/// Build a script-visible argument error naming the function and position
pub fn arg_error(fn_name: &str, index: usize, expected: &str, got: &Dynamic) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        format!(
            "argument error: {fn_name}: argument #{index} must be {expected}, got {}",
            got.type_name()
        )
        .into(),
        Position::NONE,
    ))
}

/// Expect a string argument
pub fn check_string(
    fn_name: &str,
    index: usize,
    value: &Dynamic,
) -> Result<ImmutableString, Box<EvalAltResult>> {
    value
        .clone()
        .try_cast::<ImmutableString>()
        .ok_or_else(|| arg_error(fn_name, index, "a string", value))
}

/// Expect an integer argument
pub fn check_int(fn_name: &str, index: usize, value: &Dynamic) -> Result<i64, Box<EvalAltResult>> {
    value
        .as_int()
        .map_err(|_| arg_error(fn_name, index, "an integer", value))
}

/// Expect a boolean argument
pub fn check_bool(fn_name: &str, index: usize, value: &Dynamic) -> Result<bool, Box<EvalAltResult>> {
    value
        .as_bool()
        .map_err(|_| arg_error(fn_name, index, "a boolean", value))
}

/// Expect a duration: an integer count of milliseconds, or a suffixed
/// string such as `"100ms"`, `"15s"`, `"2m"`
pub fn check_duration(
    fn_name: &str,
    index: usize,
    value: &Dynamic,
) -> Result<Duration, Box<EvalAltResult>> {
    if let Ok(ms) = value.as_int() {
        if ms < 0 {
            return Err(arg_error(fn_name, index, "a non-negative duration", value));
        }
        return Ok(Duration::from_millis(ms as u64));
    }
    if let Some(text) = value.clone().try_cast::<ImmutableString>() {
        if let Some(duration) = crate::config::Dur::parse(&text) {
            return Ok(duration);
        }
    }
    Err(arg_error(fn_name, index, "a duration (ms or \"15s\")", value))
}

/// Expect an RFC 3339 timestamp string
pub fn check_time(
    fn_name: &str,
    index: usize,
    value: &Dynamic,
) -> Result<DateTime<FixedOffset>, Box<EvalAltResult>> {
    let text = check_string(fn_name, index, value)?;
    DateTime::parse_from_rfc3339(&text)
        .map_err(|_| arg_error(fn_name, index, "an RFC 3339 timestamp", value))
}

/// Expect a map argument
pub fn check_map(fn_name: &str, index: usize, value: &Dynamic) -> Result<Map, Box<EvalAltResult>> {
    value
        .clone()
        .try_cast::<Map>()
        .ok_or_else(|| arg_error(fn_name, index, "a map", value))
}

/// Expect a map of string values
pub fn check_string_map(
    fn_name: &str,
    index: usize,
    value: &Dynamic,
) -> Result<BTreeMap<String, String>, Box<EvalAltResult>> {
    let map = check_map(fn_name, index, value)?;
    let mut out = BTreeMap::new();
    for (key, entry) in map {
        let text = entry
            .try_cast::<ImmutableString>()
            .ok_or_else(|| arg_error(fn_name, index, "a map of strings", value))?;
        out.insert(key.to_string(), text.to_string());
    }
    Ok(out)
}

/// Expect a function-pointer argument
pub fn check_fn(fn_name: &str, index: usize, value: &Dynamic) -> Result<FnPtr, Box<EvalAltResult>> {
    value
        .clone()
        .try_cast::<FnPtr>()
        .ok_or_else(|| arg_error(fn_name, index, "a function", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_string() {
        let good = Dynamic::from("hello");
        assert_eq!(check_string("f", 1, &good).unwrap().as_str(), "hello");
        let bad = Dynamic::from(7_i64);
        let err = check_string("f", 1, &bad).unwrap_err();
        assert!(err.to_string().contains("argument error"));
        assert!(err.to_string().contains("argument #1"));
    }

    #[test]
    fn test_check_duration_forms() {
        assert_eq!(
            check_duration("f", 1, &Dynamic::from(250_i64)).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            check_duration("f", 1, &Dynamic::from("2s")).unwrap(),
            Duration::from_secs(2)
        );
        assert!(check_duration("f", 1, &Dynamic::from(-1_i64)).is_err());
        assert!(check_duration("f", 1, &Dynamic::from("later")).is_err());
    }

    #[test]
    fn test_check_time_rfc3339() {
        let ts = Dynamic::from("2026-03-01T12:30:00Z");
        let parsed = check_time("f", 1, &ts).unwrap();
        assert_eq!(parsed.timestamp(), 1772368200);
        assert!(check_time("f", 1, &Dynamic::from("yesterday")).is_err());
    }

    #[test]
    fn test_exec_stack_nesting() {
        assert!(current().is_none());
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let _entered = runtime.enter();
        let empty_ast = rhai::Engine::new_raw().compile("").unwrap();
        let image = ScriptImage::new(empty_ast);
        let outer = ExecContext::new(image.clone(), Mode::Test).unwrap();
        let guard = enter(outer);
        assert!(current().is_some());
        {
            let inner = ExecContext::new(image, Mode::Debug).unwrap();
            let _inner_guard = enter(inner);
            assert_eq!(current().unwrap().mode, Mode::Debug);
        }
        assert_eq!(current().unwrap().mode, Mode::Test);
        drop(guard);
        assert!(current().is_none());
    }
}
