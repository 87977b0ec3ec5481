//! Filesystem utilities for lvhd.
//!
//! This module provides crash-safe file operations used by the file-backed
//! journal: a create that never overwrites and never leaves a partial file
//! under the final name, and a remove whose effect is durable.

pub mod atomic;

pub use atomic::{create_new_durable, remove_durable};
