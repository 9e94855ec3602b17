//! kiln-core — shared types for Kiln.
//!
//! - [`ComponentType`] and component ID rules
//! - [`Specification`]: the run contract (mountpoints, environment) read
//!   from a component's specification document
//! - [`KilnConfig`]: the optional `kiln.toml` configuration

pub mod config;
pub mod spec;
pub mod types;

pub use config::{ConfigError, ContentionPolicy, KilnConfig, parse_duration};
pub use spec::{Mountpoint, SpecError, SpecResult, Specification};
pub use types::*;
