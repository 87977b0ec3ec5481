//! Named host-local lock over a POSIX record lock.

use super::fcntl;
use super::guard::LockGuard;
use super::store::LockFile;
use super::types::{LockMode, LockOwner};
use crate::error::{LvhdError, Result};
use std::path::Path;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, warn};

/// A named lock in a namespace.
///
/// Obtained from [`LockStore::lock`](super::LockStore::lock). Released on
/// drop if still held.
#[derive(Debug)]
pub struct AdvisoryLock {
    name: String,
    namespace: String,
    mode: LockMode,
    shared: Arc<LockFile>,
    /// Thread that reserved the lock while held.
    holder: Option<ThreadId>,
}

impl AdvisoryLock {
    pub(super) fn new(name: String, namespace: String, mode: LockMode, shared: Arc<LockFile>) -> Self {
        Self {
            name,
            namespace,
            mode,
            shared,
            holder: None,
        }
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The namespace directory name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Path of the backing lock file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Read or write.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether this instance holds the lock.
    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    /// Take the lock, blocking until it is available.
    ///
    /// A non-blocking attempt is made first so the blocking holder can be
    /// logged. Fails with a contract violation if this instance, or another
    /// instance held by the calling thread, already holds the lock.
    pub fn acquire(&mut self) -> Result<()> {
        if self.is_held() {
            return Err(LvhdError::ContractViolation(format!(
                "attempt to lock '{}' twice",
                self.path().display()
            )));
        }

        if self.try_acquire()? {
            debug!("Acquired lock: path={}, mode={}", self.path().display(), self.mode.as_str());
            return Ok(());
        }

        match self.owner() {
            Ok(Some(owner)) => debug!(
                "Failed to lock on first attempt: path={}, blocked_by={}",
                self.path().display(),
                owner
            ),
            _ => debug!("Failed to lock on first attempt: path={}", self.path().display()),
        }

        let thread = self.shared.reserve(self.mode)?;
        if let Err(e) = fcntl::lock(&self.shared.file, self.mode.record_type()) {
            let _ = self.shared.unreserve(self.mode, thread, false);
            return Err(LvhdError::LockError(format!(
                "failed to lock '{}': {}",
                self.path().display(),
                e
            )));
        }

        self.holder = Some(thread);
        debug!("Acquired lock: path={}, mode={}", self.path().display(), self.mode.as_str());
        Ok(())
    }

    /// Take the lock if nobody else holds it.
    ///
    /// Returns `false` without touching the OS lock if this instance already
    /// holds it.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.is_held() {
            return Ok(false);
        }
        let Some(thread) = self.shared.try_reserve(self.mode) else {
            return Ok(false);
        };

        match fcntl::try_lock(&self.shared.file, self.mode.record_type()) {
            Ok(true) => {
                self.holder = Some(thread);
                Ok(true)
            }
            Ok(false) => {
                let _ = self.shared.unreserve(self.mode, thread, false);
                Ok(false)
            }
            Err(e) => {
                let _ = self.shared.unreserve(self.mode, thread, false);
                Err(LvhdError::LockError(format!(
                    "failed to lock '{}': {}",
                    self.path().display(),
                    e
                )))
            }
        }
    }

    /// Release the lock. Fails with a contract violation if not held.
    pub fn release(&mut self) -> Result<()> {
        let Some(thread) = self.holder.take() else {
            return Err(LvhdError::ContractViolation(format!(
                "release of unheld lock '{}'",
                self.path().display()
            )));
        };

        self.shared.unreserve(self.mode, thread, true).map_err(|e| {
            LvhdError::LockError(format!(
                "failed to unlock '{}': {}",
                self.path().display(),
                e
            ))
        })?;
        debug!("Released lock: path={}", self.path().display());
        Ok(())
    }

    /// Who holds the lock: this process if it is held here, otherwise the
    /// process holding a conflicting record lock, or `None` if free.
    pub fn owner(&self) -> Result<Option<LockOwner>> {
        if self.is_held() || self.shared.held_locally() {
            return Ok(Some(LockOwner::current()));
        }

        fcntl::conflicting_pid(&self.shared.file, LockMode::Write.record_type())
            .map(|pid| pid.map(LockOwner::Process))
            .map_err(|e| {
                LvhdError::LockError(format!(
                    "failed to query lock '{}': {}",
                    self.path().display(),
                    e
                ))
            })
    }

    /// Acquire the lock and return a guard that releases it when dropped.
    pub fn guard(&mut self) -> Result<LockGuard<'_>> {
        self.acquire()?;
        Ok(LockGuard::new(self))
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if self.is_held()
            && let Err(e) = self.release()
        {
            warn!("Failed to release lock on drop: error={}", e);
        }
    }
}
