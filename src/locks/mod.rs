//! Locking subsystem for lvhd.
//!
//! This module implements host-local named locks backed by POSIX advisory
//! record locks (`fcntl(2)`), the primitive every other component serializes
//! on.
//!
//! # Lock Files
//!
//! Lock files live under a base directory (default `/var/lock/sm`), one
//! subdirectory per namespace: `<base>/<namespace>/<name>`. Locks without a
//! namespace use the reserved `.nil` directory. Files and directories are
//! created on first use and tolerate concurrent creators.
//!
//! # Double Locking
//!
//! The OS lets a process re-lock a record it already holds. An
//! [`AdvisoryLock`] does not: `try_acquire` on a held lock returns `false`,
//! `acquire` fails with a contract violation and `release` on an unheld lock
//! fails too.
//!
//! # Per-process Sharing
//!
//! Record locks belong to a process and are dropped when the process closes
//! *any* descriptor of the file. A [`LockStore`] therefore opens each lock
//! file once and shares the descriptor between every `AdvisoryLock` it hands
//! out for that path, tracking in-process holders itself. Locks obtained from
//! two independent stores rooted at the same directory do not share this
//! bookkeeping.
//!
//! # RAII Guards
//!
//! [`AdvisoryLock::guard`] acquires and returns a [`LockGuard`] that releases
//! the lock when dropped.

mod advisory;
mod fcntl;
mod guard;
mod store;
mod types;


// Re-export public API
pub use advisory::AdvisoryLock;
pub use guard::LockGuard;
pub use store::LockStore;
pub use types::{LockInfo, LockMode, LockOwner, NO_NAMESPACE};
