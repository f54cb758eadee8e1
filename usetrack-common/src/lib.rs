// usetrack-common - Shared types, errors and configuration for usetrack
//
// This crate defines the vocabulary every other usetrack crate speaks:
// tracker kinds, units, namespaces, aggregate records and the config layers.

pub mod config;
pub mod error;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use error::*;
pub use types::*;
