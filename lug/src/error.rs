//! Error types shared by the bridge runtime
//!
//! Every failure that can cross the script⇄native boundary is expressed as
//! an [`Error`] carrying one of the stable [`ErrorKind`] tags. Script-facing
//! functions convert an [`Error`] into a Rhai runtime exception whose text
//! starts with the kind tag, so scripts can dispatch on it inside
//! `try`/`catch`.

use std::fmt;

use rhai::{EvalAltResult, Position};
use thiserror::Error;

/// Result type alias using the runtime error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable category of a runtime error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid argument passed from a script
    ArgumentError,
    /// A `(method, pattern)` pair was registered twice
    RouteConflict,
    /// No route matched the request path
    NotFound,
    /// The matched route is bound to a different host
    HostMismatch,
    /// The matched route has no handler for the request method
    MethodNotAllowed,
    /// A deadline expired
    Timeout,
    /// The worker semaphore could not be acquired in time
    ConcurrencyLimit,
    /// The response header was already written
    ResponseAlreadyWritten,
    /// The connection was hijacked by the handler
    Hijacked,
    /// A status code outside the allowed range
    InvalidStatus,
    /// Template parsing or rendering failed
    TemplateError,
    /// The requested database driver is not compiled in
    DriverUnsupported,
    /// A builder terminal verb ran without a table
    MissingTable,
    /// `update`/`delete` ran without a recorded where clause
    MissingWhere,
    /// Transaction begin/commit/rollback failed
    TxError,
    /// `fetch` matched no rows
    NoRows,
    /// A file path escaped its serving root
    PathTraversal,
    /// Filesystem or network I/O failed
    IOError,
    /// Script evaluation raised an error
    ScriptError,
    /// A handler task panicked and was recovered
    Panic,
}

impl ErrorKind {
    /// The HTTP status this kind materializes as when a handler fails
    pub fn status(self) -> u16 {
        match self {
            Self::NotFound | Self::HostMismatch => 404,
            Self::MethodNotAllowed => 405,
            Self::Timeout => 408,
            Self::ConcurrencyLimit => 503,
            Self::PathTraversal => 403,
            Self::ArgumentError | Self::InvalidStatus => 400,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::ArgumentError => "argument error",
            Self::RouteConflict => "route conflict",
            Self::NotFound => "not found",
            Self::HostMismatch => "host mismatch",
            Self::MethodNotAllowed => "method not allowed",
            Self::Timeout => "timeout",
            Self::ConcurrencyLimit => "concurrency limit",
            Self::ResponseAlreadyWritten => "response already written",
            Self::Hijacked => "hijacked",
            Self::InvalidStatus => "invalid status",
            Self::TemplateError => "template error",
            Self::DriverUnsupported => "driver unsupported",
            Self::MissingTable => "missing table",
            Self::MissingWhere => "missing where",
            Self::TxError => "transaction error",
            Self::NoRows => "no rows",
            Self::PathTraversal => "path traversal",
            Self::IOError => "io error",
            Self::ScriptError => "script error",
            Self::Panic => "panic",
        };
        f.write_str(tag)
    }
}

/// Main error type for the bridge runtime
#[derive(Debug, Error)]
pub enum Error {
    /// Error with a stable kind and a message
    #[error("{kind}: {message}")]
    Tagged {
        /// Stable category
        kind: ErrorKind,
        /// Human-readable detail
        message: String,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    /// Template error
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Script evaluation error
    #[error("script error: {0}")]
    Script(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(Box<figment::Error>),
}

impl Error {
    /// Create a tagged error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Tagged {
            kind,
            message: message.into(),
        }
    }

    /// The stable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Tagged { kind, .. } => *kind,
            Self::Io(_) => ErrorKind::IOError,
            Self::Sql(sqlx::Error::RowNotFound) => ErrorKind::NoRows,
            Self::Sql(_) => ErrorKind::TxError,
            Self::Template(_) => ErrorKind::TemplateError,
            Self::Script(_) => ErrorKind::ScriptError,
            Self::Config(_) => ErrorKind::ArgumentError,
        }
    }

    /// The HTTP status this error materializes as
    pub fn status(&self) -> u16 {
        self.kind().status()
    }

    /// Convert into a script-visible runtime exception
    pub fn into_script(self) -> Box<EvalAltResult> {
        Box::new(EvalAltResult::ErrorRuntime(
            self.to_string().into(),
            Position::NONE,
        ))
    }
}

impl From<Error> for Box<EvalAltResult> {
    fn from(err: Error) -> Self {
        err.into_script()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<Box<EvalAltResult>> for Error {
    fn from(err: Box<EvalAltResult>) -> Self {
        Self::Script(err.to_string())
    }
}

/// Canonical reason phrase for an HTTP status code
pub fn status_text(code: u16) -> &'static str {
    http::StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status")
}
