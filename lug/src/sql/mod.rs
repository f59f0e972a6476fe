//! SQL bridge: connection registry, chainable builder, transaction scope

pub mod builder;
pub mod module;
pub mod registry;

pub use builder::{BuilderState, Driver, SqlArg};
pub use module::Db;
