//! Configuration model for lvhd.
//!
//! This module defines the Config struct that holds the host-local settings
//! every component needs: where lock files live, how the volume manager is
//! invoked, the journal volume geometry and the retry policy for enforced
//! activations. It supports forward-compatible YAML parsing (unknown fields
//! are ignored), defaults for every field, and validation of values.

mod model;
mod operations;
pub mod types;


// Re-export public API
pub use model::Config;
