//! # lug
//!
//! Embedded-script service runtime. Scripts written in Rhai drive a
//! library of infrastructure primitives (an HTTP server with a trie
//! router and script middleware chains, a chainable SQL bridge with
//! shared connections and transactions, an HTTP client, templates, and
//! filesystem/URL/UTF-8/JSON helpers) through a pooled interpreter
//! bridge.
//!
//! ## Architecture
//!
//! - **Interpreter pool** ([`interp::pool`]): a free list of configured
//!   engines; request handlers borrow one cloned from the registering
//!   script's image.
//! - **Server engine** ([`http::server`]): TCP/TLS listener, bounded
//!   worker semaphore, per-request deadline, panic recovery, graceful
//!   shutdown on SIGINT/SIGTERM or script request.
//! - **Route trie** ([`router`]): static, parametric, regex-constrained
//!   and trailing-wildcard segments with host gating.
//! - **SQL bridge** ([`sql`]): DSN-keyed shared pools, chainable builder,
//!   transaction scope over a script callback.
//!
//! ## Example
//!
//! ```rhai
//! let app = server::create(#{ addr: ":3000", workers: 100 });
//! app.middleware(|ctx| { ctx.setHeader("X-Powered-By", "lug"); ctx.next(); });
//! app.route("GET /users/{id:[0-9]+}", |ctx| ctx.write(ctx.param("id")));
//! app.listen();
//! ```

pub mod config;
pub mod error;
pub mod host;
pub mod http;
pub mod interp;
pub mod modules;
pub mod observability;
pub mod router;
pub mod sql;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LogLevel, Mode, ServerConfig};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::host::{Host, HostOptions};
    pub use crate::http::{App, Ctx};
    pub use crate::interp::{pool, ExecContext, PooledInterp, ScriptImage};
    pub use crate::observability::init_tracing;
    pub use crate::router::{Pattern, Router};
    pub use crate::sql::{Db, Driver};
}
