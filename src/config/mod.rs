//! Configuration loading and parsing.
//!
//! This module provides the YAML engine configuration and loading of job
//! definitions from YAML files.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::{YamlLoader, load_jobs_from_directory};
pub use types::{EngineConfig, StorageConfig};
