//! Lock type definitions and information structures.

use std::path::PathBuf;

/// Namespace directory used for locks created without a namespace.
pub const NO_NAMESPACE: &str = ".nil";

/// Kind of record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Exclusive lock.
    #[default]
    Write,
    /// Shared lock; conflicts only with writers.
    Read,
}

impl LockMode {
    /// Get the name used in log messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Write => "write",
            LockMode::Read => "read",
        }
    }

    pub(super) fn record_type(&self) -> libc::c_short {
        match self {
            LockMode::Write => libc::F_WRLCK as libc::c_short,
            LockMode::Read => libc::F_RDLCK as libc::c_short,
        }
    }
}

/// Identity of a lock holder.
///
/// Compared, displayed and logged; never used to signal or inspect the
/// holding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockOwner {
    /// An OS process.
    Process(u32),
}

impl LockOwner {
    /// The calling process.
    pub fn current() -> Self {
        LockOwner::Process(std::process::id())
    }

    /// Process id of the holder.
    pub fn pid(&self) -> u32 {
        match self {
            LockOwner::Process(pid) => *pid,
        }
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockOwner::Process(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Information about a lock file found in a namespace.
#[derive(Debug, Clone)]
pub struct LockInfo {
    /// The lock file path.
    pub path: PathBuf,

    /// The lock name.
    pub name: String,

    /// The namespace directory name.
    pub namespace: String,

    /// Who currently holds the lock, if anyone.
    pub owner: Option<LockOwner>,
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}/{} (held by {})", self.namespace, self.name, owner),
            None => write!(f, "{}/{} (free)", self.namespace, self.name),
        }
    }
}
