//! Logical volume layer for lvhd.
//!
//! - [`VolumeManager`] is the seam to the host's volume manager; [`LvmCommands`]
//!   implements it by running LVM commands.
//! - [`VolumeMetadataCache`] keeps a per-volume-group inventory in memory,
//!   refreshed lazily, and implements the lock-guarded, refcounted
//!   activate/deactivate protocol on top of it.

mod cache;
pub mod command;
mod info;
mod manager;


// Re-export public API
pub use cache::VolumeMetadataCache;
pub use info::{HIDDEN_TAG, LvInfo, mapper_name, parse_lvs_line, round_up_size, validate_lv_name};
pub use manager::{LvmCommands, VolumeManager};
