//! Interpreter pool
//!
//! A process-wide free list of fully configured engines. Borrowing hands
//! out an owned engine inside a RAII guard; dropping the guard returns the
//! engine to the free list. An engine is therefore held by at most one
//! thread at a time, which is the entire concurrency contract the embedded
//! language demands.
//!
//! `clone_from` is the bridge's "clone the caller's globals" primitive: it
//! borrows an engine and attaches the source script's compiled AST so the
//! borrower can resolve and invoke the script's function pointers. The AST
//! is immutable after load, so the attachment is read-only by construction.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, FuncArgs};

use crate::error::{Error, ErrorKind, Result};
use crate::interp::kit::ScriptImage;

static FREE_LIST: Lazy<Mutex<Vec<Box<Engine>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// A borrowed interpreter; returns to the pool on drop
pub struct PooledInterp {
    engine: Option<Box<Engine>>,
    image: Option<ScriptImage>,
    tuned: bool,
}

impl PooledInterp {
    /// The borrowed engine
    pub fn engine(&self) -> &Engine {
        // The option is only emptied in drop.
        self.engine.as_ref().expect("pooled engine present until drop")
    }

    /// Mutable access for per-session tuning (limits, hooks)
    ///
    /// A tuned engine is discarded instead of recycled, so per-session
    /// limits never leak into other borrowers.
    pub fn engine_mut(&mut self) -> &mut Engine {
        self.tuned = true;
        self.engine.as_mut().expect("pooled engine present until drop")
    }

    /// The attached script image, if borrowed via [`clone_from`]
    pub fn image(&self) -> Option<&ScriptImage> {
        self.image.as_ref()
    }

    /// Invoke a script callable against the attached script image
    pub fn call_fn(&self, fn_ptr: &FnPtr, args: impl FuncArgs) -> std::result::Result<Dynamic, Box<EvalAltResult>> {
        let image = self.image.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::ScriptError, "interpreter has no attached script image").into_script()
        })?;
        fn_ptr.call::<Dynamic>(self.engine(), image.ast(), args)
    }
}

impl Drop for PooledInterp {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            if self.tuned {
                return;
            }
            if let Ok(mut free) = FREE_LIST.lock() {
                free.push(engine);
            }
        }
    }
}

/// Borrow an idle interpreter, constructing a fresh one if the pool is empty
///
/// Construction failure (a module failed to register) is fatal to the
/// caller; there is no degraded engine.
pub fn acquire() -> Result<PooledInterp> {
    let recycled = FREE_LIST
        .lock()
        .map_err(|_| Error::new(ErrorKind::Panic, "interpreter pool lock poisoned"))?
        .pop();
    let engine = match recycled {
        Some(engine) => engine,
        None => Box::new(build_engine()?),
    };
    Ok(PooledInterp {
        engine: Some(engine),
        image: None,
        tuned: false,
    })
}

/// Borrow an interpreter with the source script's globals attached
pub fn clone_from(image: &ScriptImage) -> Result<PooledInterp> {
    let mut interp = acquire()?;
    interp.image = Some(image.clone());
    Ok(interp)
}

/// Finalize every pooled interpreter
pub fn shutdown() {
    if let Ok(mut free) = FREE_LIST.lock() {
        free.clear();
    }
}

/// Number of idle interpreters currently pooled
pub fn idle_count() -> usize {
    FREE_LIST.lock().map(|free| free.len()).unwrap_or(0)
}

fn build_engine() -> Result<Engine> {
    let mut engine = Engine::new();

    engine.on_print(|text| crate::observability::script_print(text));
    engine.on_debug(|text, source, pos| {
        let mode = crate::interp::kit::current().map(|c| c.mode).unwrap_or_default();
        crate::observability::script_debug(mode, text, source, pos.line());
    });

    crate::modules::register_all(&mut engine)?;
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_yields_working_engine() {
        let interp = acquire().unwrap();
        let result: i64 = interp.engine().eval("40 + 2").unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_drop_returns_engine_to_pool() {
        let before = {
            let _a = acquire().unwrap();
            let _b = acquire().unwrap();
            idle_count()
        };
        // both loans returned on drop
        assert!(idle_count() >= before + 2);
    }

    #[test]
    fn test_concurrent_borrowers_get_distinct_engines() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    let interp = acquire().unwrap();
                    let addr = interp.engine() as *const Engine as usize;
                    // hold the loan long enough to overlap with peers
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    let check: i64 = interp.engine().eval("1 + 1").unwrap();
                    assert_eq!(check, 2);
                    addr
                })
            })
            .collect();
        let mut addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        addresses.sort_unstable();
        addresses.dedup();
        assert_eq!(addresses.len(), 8, "two borrowers observed the same engine");
    }

    #[test]
    fn test_clone_from_resolves_source_functions() {
        let interp = acquire().unwrap();
        let ast = interp
            .engine()
            .compile("fn double(x) { x * 2 }")
            .unwrap();
        let image = ScriptImage::new(ast);
        drop(interp);

        let borrowed = clone_from(&image).unwrap();
        let fn_ptr = FnPtr::new("double").unwrap();
        let result = borrowed.call_fn(&fn_ptr, (21_i64,)).unwrap();
        assert_eq!(result.as_int().unwrap(), 42);
    }

    #[test]
    fn test_call_fn_without_image_errors() {
        let interp = acquire().unwrap();
        let fn_ptr = FnPtr::new("missing").unwrap();
        let err = interp.call_fn(&fn_ptr, ()).unwrap_err();
        assert!(err.to_string().contains("script image"));
    }
}
