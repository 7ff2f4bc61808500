//! This mod holds the crate's client-facing configuration and error types.
mod context;
mod error;
mod namespace;
mod options;

pub use context::Context;
pub use error::Error;
pub use namespace::validate as validate_namespace;
pub use options::default_logger;
pub use options::Config;
pub use options::ConfigError;
pub use options::Options;
