//! Lock file layout, per-process descriptor sharing and cleanup.

use super::advisory::AdvisoryLock;
use super::fcntl;
use super::types::{LockInfo, LockMode, LockOwner, NO_NAMESPACE};
use crate::config::Config;
use crate::error::{LvhdError, Result};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

/// In-process holders of one lock file, by the thread that reserved.
#[derive(Debug, Default)]
struct Holders {
    writer: Option<ThreadId>,
    readers: Vec<ThreadId>,
}

impl Holders {
    fn reserve(&mut self, mode: LockMode, thread: ThreadId) -> bool {
        match mode {
            LockMode::Write if self.writer.is_none() && self.readers.is_empty() => {
                self.writer = Some(thread);
                true
            }
            LockMode::Read if self.writer.is_none() => {
                self.readers.push(thread);
                true
            }
            _ => false,
        }
    }

    /// Whether waiting for `mode` would wait on a reservation of `thread`.
    fn held_by(&self, mode: LockMode, thread: ThreadId) -> bool {
        match mode {
            LockMode::Write => self.writer == Some(thread) || self.readers.contains(&thread),
            LockMode::Read => self.writer == Some(thread),
        }
    }

    fn release(&mut self, mode: LockMode, thread: ThreadId) {
        match mode {
            LockMode::Write => self.writer = None,
            LockMode::Read => {
                if let Some(pos) = self.readers.iter().position(|t| *t == thread) {
                    self.readers.swap_remove(pos);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

/// One open lock file, shared by every `AdvisoryLock` on the same path.
#[derive(Debug)]
pub(super) struct LockFile {
    pub(super) path: PathBuf,
    pub(super) file: File,
    holders: Mutex<Holders>,
    freed: Condvar,
}

impl LockFile {
    fn holders(&self) -> MutexGuard<'_, Holders> {
        self.holders.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Claim the in-process side of the lock without waiting.
    ///
    /// Returns the reserving thread, which must be handed back to
    /// [`unreserve`](Self::unreserve).
    pub(super) fn try_reserve(&self, mode: LockMode) -> Option<ThreadId> {
        let thread = thread::current().id();
        self.holders().reserve(mode, thread).then_some(thread)
    }

    /// Claim the in-process side of the lock, waiting for other holders in
    /// this process to release it.
    ///
    /// A thread waiting on its own reservation would never wake, so that is
    /// a contract violation instead.
    pub(super) fn reserve(&self, mode: LockMode) -> Result<ThreadId> {
        let thread = thread::current().id();
        let mut holders = self.holders();
        while !holders.reserve(mode, thread) {
            if holders.held_by(mode, thread) {
                return Err(LvhdError::ContractViolation(format!(
                    "attempt to lock '{}' twice from one thread",
                    self.path.display()
                )));
            }
            holders = self
                .freed
                .wait(holders)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        Ok(thread)
    }

    /// Give back the reservation `thread` made.
    ///
    /// `locked` says whether the caller obtained the record lock; the record
    /// lock is dropped once no in-process holder remains.
    pub(super) fn unreserve(&self, mode: LockMode, thread: ThreadId, locked: bool) -> io::Result<()> {
        let mut holders = self.holders();
        holders.release(mode, thread);
        let result = if locked && holders.is_empty() {
            fcntl::unlock(&self.file)
        } else {
            Ok(())
        };
        drop(holders);
        self.freed.notify_all();
        result
    }

    /// Whether any lock in this process currently holds the file.
    pub(super) fn held_locally(&self) -> bool {
        !self.holders().is_empty()
    }
}

/// Root of a host-local lock namespace tree.
///
/// Clones share the open-file registry.
#[derive(Debug, Clone)]
pub struct LockStore {
    base: PathBuf,
    open: Arc<Mutex<HashMap<PathBuf, Weak<LockFile>>>>,
}

impl LockStore {
    /// Lock store rooted at `base`.
    pub fn new<P: Into<PathBuf>>(base: P) -> Self {
        Self {
            base: base.into(),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Lock store rooted at the configured lock directory.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.lock_dir.clone())
    }

    /// Base directory of the tree.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory holding the lock files of a namespace.
    pub fn namespace_dir(&self, namespace: Option<&str>) -> PathBuf {
        self.base.join(namespace.unwrap_or(NO_NAMESPACE))
    }

    /// Path of the lock file for `name` in `namespace`.
    pub fn lock_path(&self, name: &str, namespace: Option<&str>) -> PathBuf {
        self.namespace_dir(namespace).join(name)
    }

    /// Exclusive lock for `name` in `namespace`, creating the file if needed.
    pub fn lock(&self, name: &str, namespace: Option<&str>) -> Result<AdvisoryLock> {
        self.lock_with_mode(name, namespace, LockMode::Write)
    }

    /// Lock for `name` in `namespace` in the given mode.
    pub fn lock_with_mode(
        &self,
        name: &str,
        namespace: Option<&str>,
        mode: LockMode,
    ) -> Result<AdvisoryLock> {
        validate_component("lock name", name)?;
        if let Some(ns) = namespace {
            validate_component("lock namespace", ns)?;
        }

        let shared = self.open_shared(name, namespace)?;
        Ok(AdvisoryLock::new(
            name.to_string(),
            namespace.unwrap_or(NO_NAMESPACE).to_string(),
            mode,
            shared,
        ))
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, Weak<LockFile>>> {
        self.open.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn open_shared(&self, name: &str, namespace: Option<&str>) -> Result<Arc<LockFile>> {
        let nspath = self.namespace_dir(namespace);
        let path = nspath.join(name);

        let mut registry = self.registry();
        if let Some(shared) = registry.get(&path).and_then(Weak::upgrade) {
            return Ok(shared);
        }

        // create_dir_all treats a directory made concurrently as success.
        fs::create_dir_all(&nspath).map_err(|e| {
            LvhdError::LockError(format!(
                "failed to create lock directory '{}': {}",
                nspath.display(),
                e
            ))
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                LvhdError::LockError(format!(
                    "failed to open lock file '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let shared = Arc::new(LockFile {
            path: path.clone(),
            file,
            holders: Mutex::new(Holders::default()),
            freed: Condvar::new(),
        });
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(path, Arc::downgrade(&shared));
        Ok(shared)
    }

    /// Remove the lock file for `name` and, if it is now empty, its namespace
    /// directory.
    ///
    /// Only call this when no process can be using the lock. Fails with a
    /// contract violation if a lock in this process holds it.
    pub fn cleanup(&self, name: &str, namespace: Option<&str>) -> Result<()> {
        let nspath = self.namespace_dir(namespace);
        let path = nspath.join(name);

        {
            let mut registry = self.registry();
            if let Some(shared) = registry.get(&path).and_then(Weak::upgrade)
                && shared.held_locally()
            {
                return Err(LvhdError::ContractViolation(format!(
                    "cleanup of held lock '{}'",
                    path.display()
                )));
            }
            registry.remove(&path);
        }
        unlink(&path)?;
        remove_dir_if_empty(&nspath)
    }

    /// Remove every lock file in `namespace` and the namespace directory.
    ///
    /// Only call this when no process can be using any lock in the namespace.
    pub fn cleanup_all(&self, namespace: &str) -> Result<()> {
        let nspath = self.namespace_dir(Some(namespace));
        let entries = match fs::read_dir(&nspath) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(LvhdError::LockError(format!(
                    "failed to read lock directory '{}': {}",
                    nspath.display(),
                    e
                )));
            }
        };

        {
            let mut registry = self.registry();
            registry.retain(|path, _| !path.starts_with(&nspath));
        }

        for entry in entries {
            let entry = entry.map_err(|e| {
                LvhdError::LockError(format!("failed to read lock directory entry: {}", e))
            })?;
            unlink(&entry.path())?;
        }

        match fs::remove_dir(&nspath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LvhdError::LockError(format!(
                "failed to remove lock directory '{}': {}",
                nspath.display(),
                e
            ))),
        }
    }

    /// List the lock files of a namespace with their current holders.
    pub fn list(&self, namespace: Option<&str>) -> Result<Vec<LockInfo>> {
        let nspath = self.namespace_dir(namespace);
        let mut locks = Vec::new();

        let entries = match fs::read_dir(&nspath) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(locks),
            Err(e) => {
                return Err(LvhdError::LockError(format!(
                    "failed to read lock directory '{}': {}",
                    nspath.display(),
                    e
                )));
            }
        };

        for entry in entries {
            let entry = entry.map_err(|e| {
                LvhdError::LockError(format!("failed to read lock directory entry: {}", e))
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let owner = self.probe_owner(&path)?;
            locks.push(LockInfo {
                name: name.to_string(),
                namespace: namespace.unwrap_or(NO_NAMESPACE).to_string(),
                path: path.clone(),
                owner,
            });
        }

        locks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(locks)
    }

    fn probe_owner(&self, path: &Path) -> Result<Option<LockOwner>> {
        let shared = self.registry().get(path).and_then(Weak::upgrade);
        let probe = |file: &File| {
            fcntl::conflicting_pid(file, LockMode::Write.record_type())
                .map(|pid| pid.map(LockOwner::Process))
                .map_err(|e| {
                    LvhdError::LockError(format!(
                        "failed to query lock '{}': {}",
                        path.display(),
                        e
                    ))
                })
        };

        match shared {
            Some(shared) if shared.held_locally() => Ok(Some(LockOwner::current())),
            Some(shared) => probe(&shared.file),
            // Nothing in this store has the file open, so this process holds
            // no record lock a close could drop.
            None => match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => probe(&file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(LvhdError::LockError(format!(
                    "failed to open lock file '{}': {}",
                    path.display(),
                    e
                ))),
            },
        }
    }
}

fn validate_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(LvhdError::LockError(format!(
            "invalid {} '{}': must be a single non-empty path component",
            what, value
        )));
    }
    Ok(())
}

fn unlink(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed lock file: path={}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LvhdError::LockError(format!(
            "failed to remove lock file '{}': {}",
            path.display(),
            e
        ))),
    }
}

fn remove_dir_if_empty(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.raw_os_error() == Some(libc::ENOTEMPTY)
                || e.raw_os_error() == Some(libc::EEXIST) =>
        {
            Ok(())
        }
        Err(e) => Err(LvhdError::LockError(format!(
            "failed to remove lock directory '{}': {}",
            path.display(),
            e
        ))),
    }
}
