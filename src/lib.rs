//! lvhd: crash-consistent control plane for LVM-backed virtual disks.
//!
//! The crate provides the pieces a storage driver builds on:
//! - [`locks`]: host-local named locks over POSIX record locks
//! - [`journal`]: durable records of in-progress operations, in files or in
//!   logical volumes
//! - [`lvm`]: a cached view of a volume group with refcounted activation
//! - [`activator`]: all-or-nothing activation of a set of volumes
//!
//! Configuration, error types and the event log are shared by all of them.

pub mod activator;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod journal;
pub mod locks;
pub mod lvm;
pub mod refcount;

#[cfg(test)]
pub(crate) mod test_support;

pub use activator::{LvActivator, Persistence};
pub use config::Config;
pub use error::{ErrorKind, LvhdError, Result};
pub use journal::{FileJournaler, Journal, VolumeJournaler};
pub use locks::{AdvisoryLock, LockStore};
pub use lvm::{LvmCommands, VolumeManager, VolumeMetadataCache};
pub use refcount::{MemoryRefCounter, RefCounter, RefMode};
