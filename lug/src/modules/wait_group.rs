//! `waitGroup` module: run script callbacks on fresh interpreters
//!
//! Each `run` borrows a pooled interpreter cloned from the caller's script
//! image and executes the callable on a blocking task. Task errors are
//! routed to the debug-print sink and swallowed; `wait` blocks until the
//! barrier count returns to zero.

use std::sync::{Arc, Condvar, Mutex};

use rhai::{Engine, EvalAltResult, FnPtr, Module};

use crate::interp::{kit, pool};
use crate::observability;

struct WgInner {
    count: Mutex<usize>,
    cond: Condvar,
}

/// Script-facing wait-group handle
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WgInner>,
}

impl WaitGroup {
    fn new() -> Self {
        Self {
            inner: Arc::new(WgInner {
                count: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    fn add_one(&self) {
        let mut count = self.inner.count.lock().unwrap_or_else(|p| p.into_inner());
        *count += 1;
    }

    fn done(&self) {
        let mut count = self.inner.count.lock().unwrap_or_else(|p| p.into_inner());
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.inner.count.lock().unwrap_or_else(|p| p.into_inner());
        while *count > 0 {
            count = self
                .inner
                .cond
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Outstanding task count (for tests)
    pub fn pending(&self) -> usize {
        *self.inner.count.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn launch(wg: &WaitGroup, callback: FnPtr) -> Result<(), Box<EvalAltResult>> {
    let exec = kit::require_current()?;
    wg.add_one();
    let wg = wg.clone();
    let task_exec = exec.clone();
    exec.handle.spawn_blocking(move || {
        let image = task_exec.image.clone();
        let mode = task_exec.mode;
        let _guard = kit::enter(task_exec);
        match pool::clone_from(&image) {
            Ok(interp) => {
                if let Err(err) = interp.call_fn(&callback, ()) {
                    observability::script_debug(mode, &format!("waitGroup task failed: {err}"), None, None);
                }
            }
            Err(err) => {
                observability::script_debug(mode, &format!("waitGroup interpreter unavailable: {err}"), None, None);
            }
        }
        wg.done();
    });
    Ok(())
}

/// Register the `waitGroup` module
pub fn register(engine: &mut Engine) {
    engine.register_type_with_name::<WaitGroup>("WaitGroup");
    engine.register_fn("run", |wg: &mut WaitGroup, callback: FnPtr| -> Result<(), Box<EvalAltResult>> {
        launch(wg, callback)
    });
    engine.register_fn("wait", |wg: &mut WaitGroup| {
        wg.wait();
    });

    let mut module = Module::new();
    module.set_native_fn("create", || Ok(WaitGroup::new()));
    engine.register_static_module("waitGroup", module.into());
}
