//! RAII lock guard implementation.

use super::advisory::AdvisoryLock;
use crate::error::Result;
use std::path::Path;
use tracing::warn;

/// RAII guard for a held [`AdvisoryLock`].
///
/// When dropped, the lock is released. If the release fails, a warning is
/// logged but no panic occurs.
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a mut AdvisoryLock,

    /// Whether the lock has been released manually.
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub(super) fn new(lock: &'a mut AdvisoryLock) -> Self {
        Self {
            lock,
            released: false,
        }
    }

    /// Get the path to the lock file.
    pub fn path(&self) -> &Path {
        self.lock.path()
    }

    /// Manually release the lock, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.lock.release()
        {
            warn!(
                "Failed to release lock: path={}, error={}",
                self.lock.path().display(),
                e
            );
        }
    }
}
