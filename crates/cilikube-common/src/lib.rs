//! Common types for cilikube: errors, configuration and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod telemetry;
pub mod validation;

pub use config::Config;
pub use error::{Error, UpstreamKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
