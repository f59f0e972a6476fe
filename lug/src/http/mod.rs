//! HTTP engine: connection driver, request context, middleware chain,
//! response writer, and the server itself

pub mod conn;
pub mod context;
pub mod cookie;
pub mod middleware;
pub mod multipart;
pub mod pages;
pub mod response;
pub mod server;

pub use context::Ctx;
pub use middleware::{Chain, Handler};
pub use response::ResponseWriter;
pub use server::App;
