//! Script⇄native bridge primitives: pool, value bridge, module kit

pub mod kit;
pub mod pool;
pub mod value;

pub use kit::{ExecContext, ScriptImage};
pub use pool::PooledInterp;
