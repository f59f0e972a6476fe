//! Middleware chain composition
//!
//! A route's chain is the server middlewares registered so far, in order,
//! terminated by the route handler. The chain is snapshotted at
//! registration time. At request time the first step runs directly; every
//! later step runs only when its predecessor calls `next` on the context,
//! so skipping `next` short-circuits the rest of the chain. `next` is
//! one-shot per depth; the unwinding is LIFO through the script frames.

use std::path::PathBuf;
use std::sync::Arc;

use rhai::{Dynamic, EvalAltResult, FnPtr};

use crate::error::Error;
use crate::http::context::Ctx;
use crate::interp::pool::PooledInterp;

/// One step of a request chain
#[derive(Clone)]
pub enum Handler {
    /// A script callable (middleware or route handler)
    Script(FnPtr),
    /// A native static-file handler rooted at a directory
    StaticDir(Arc<PathBuf>),
}

/// An immutable, composed request chain
#[derive(Clone)]
pub struct Chain {
    steps: Arc<Vec<Handler>>,
}

impl Chain {
    /// Compose middlewares plus a terminal handler
    pub fn compose(middlewares: &[FnPtr], terminal: Handler) -> Self {
        let mut steps: Vec<Handler> = middlewares.iter().cloned().map(Handler::Script).collect();
        steps.push(terminal);
        Self { steps: Arc::new(steps) }
    }

    /// Build a chain from explicit steps
    pub fn from_steps(steps: Vec<Handler>) -> Self {
        Self { steps: Arc::new(steps) }
    }

    /// Shared step list
    pub(crate) fn steps(&self) -> Arc<Vec<Handler>> {
        self.steps.clone()
    }

    /// Number of steps including the terminal handler
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the chain from its first step
    pub fn run(&self, interp: &PooledInterp, ctx: Ctx) -> Result<(), Box<EvalAltResult>> {
        ctx.begin_chain(self);
        let Some(first) = self.steps.first().cloned() else {
            return Ok(());
        };
        match first {
            Handler::Script(fn_ptr) => {
                let _: Dynamic = interp.call_fn(&fn_ptr, (ctx,))?;
                Ok(())
            }
            Handler::StaticDir(root) => ctx.serve_static(root.as_path()).map_err(Error::into_script),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_puts_handler_last() {
        let mw_a = FnPtr::new("a").unwrap();
        let mw_b = FnPtr::new("b").unwrap();
        let chain = Chain::compose(&[mw_a, mw_b], Handler::Script(FnPtr::new("h").unwrap()));
        assert_eq!(chain.len(), 3);
        let steps = chain.steps();
        match (&steps[0], &steps[1], &steps[2]) {
            (Handler::Script(a), Handler::Script(b), Handler::Script(h)) => {
                assert_eq!(a.fn_name(), "a");
                assert_eq!(b.fn_name(), "b");
                assert_eq!(h.fn_name(), "h");
            }
            _ => panic!("unexpected step kinds"),
        }
    }

    #[test]
    fn test_compose_without_middlewares() {
        let chain = Chain::compose(&[], Handler::Script(FnPtr::new("h").unwrap()));
        assert_eq!(chain.len(), 1);
        assert!(!chain.is_empty());
    }
}
