//! Activation transactions for lvhd.
//!
//! An [`LvActivator`] brings a set of volumes online through the refcounted
//! protocol of [`VolumeMetadataCache`] and remembers what it did, so that an
//! operation touching a whole disk chain either keeps every activation
//! ([`LvActivator::persist`]) or undoes them all
//! ([`LvActivator::deactivate_all`]).
//!
//! # Tracking
//!
//! Activations are keyed by `(Persistence, RefMode, object id)`. Temporary
//! activations last for the operation only; persistent ones outlive it once
//! committed. Rollback walks the keys in order: persistent before temporary,
//! binary before normal.
//!
//! # Enforced Activations
//!
//! Something outside the refcount protocol may deactivate a volume at any
//! time. [`LvActivator::activate_enforce`] holds the device node open, which
//! the kernel honours where the refcount alone is not.


use crate::config::Config;
use crate::error::{LvhdError, Result};
use crate::events::{Event, EventAction, EventLog};
use crate::lvm::VolumeMetadataCache;
use crate::refcount::RefMode;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long an activation is meant to last.
///
/// Orders persistent first, the order rollback undoes them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Persistence {
    /// Survives once the transaction is persisted.
    Persistent,
    /// Undone by rollback.
    Temporary,
}

/// One activation the transaction is tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedActivation {
    pub persistence: Persistence,
    pub mode: RefMode,
    pub object_id: String,
    pub lv_name: String,
}

type Key = (Persistence, RefMode, String);

/// Tracks the activations of one operation on one storage repository.
#[derive(Debug)]
pub struct LvActivator {
    namespace: String,
    cache: Arc<VolumeMetadataCache>,
    activations: BTreeMap<Key, String>,
    /// Device handles of enforced activations, by object id.
    open_files: HashMap<String, File>,
    open_retry_attempts: u32,
    open_retry_interval: Duration,
    events: EventLog,
}

impl LvActivator {
    /// Activator for the repository `sr_uuid`, sharing `cache`.
    pub fn new(sr_uuid: &str, cache: Arc<VolumeMetadataCache>, config: &Config) -> Self {
        let events = cache.event_log().clone();
        Self {
            namespace: format!("{}{}", config.lvm_namespace_prefix, sr_uuid),
            cache,
            activations: BTreeMap::new(),
            open_files: HashMap::new(),
            open_retry_attempts: config.open_retry_attempts.max(1),
            open_retry_interval: config.open_retry_interval(),
            events,
        }
    }

    /// Lock and refcount namespace of every activation.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Activate `lv_name` on behalf of `object_id` and track it.
    ///
    /// Repeating a temporary activation is a no-op; repeating a persistent
    /// one is a contract violation.
    pub fn activate(
        &mut self,
        object_id: &str,
        lv_name: &str,
        mode: RefMode,
        persistence: Persistence,
    ) -> Result<()> {
        let key = (persistence, mode, object_id.to_string());
        if self.activations.contains_key(&key) {
            if persistence == Persistence::Persistent {
                return Err(LvhdError::ContractViolation(format!(
                    "double persistent activation of '{}' ({})",
                    object_id, lv_name
                )));
            }
            debug!("Already activated: ns={}, id={}", self.namespace, object_id);
            return Ok(());
        }

        self.cache.activate(&self.namespace, object_id, lv_name, mode)?;
        self.activations.insert(key, lv_name.to_string());
        Ok(())
    }

    /// Temporarily activate `lv_name` and hold its device open.
    ///
    /// `path` defaults to the volume's device node. Opening is retried, with
    /// the volume re-activated in between, in case it was deactivated behind
    /// our back; failing every attempt is an [`LvhdError::ActivationError`].
    /// The activation stays tracked either way.
    pub fn activate_enforce(
        &mut self,
        object_id: &str,
        lv_name: &str,
        path: Option<&Path>,
    ) -> Result<()> {
        self.activate(object_id, lv_name, RefMode::Normal, Persistence::Temporary)?;
        if self.open_files.contains_key(object_id) {
            return Ok(());
        }

        let path: PathBuf = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.cache.device_path(lv_name));
        let file = self.open_with_retry(lv_name, &path)?;

        self.cache.change_open(lv_name, 1)?;
        self.open_files.insert(object_id.to_string(), file);
        Ok(())
    }

    fn open_with_retry(&self, lv_name: &str, path: &Path) -> Result<File> {
        let mut last_error = None;
        for attempt in 1..=self.open_retry_attempts {
            match File::open(path) {
                Ok(file) => return Ok(file),
                Err(e) => {
                    warn!(
                        "Failed to open device: path={}, attempt={}/{}, error={}",
                        path.display(),
                        attempt,
                        self.open_retry_attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }
            if attempt == self.open_retry_attempts {
                break;
            }

            thread::sleep(self.open_retry_interval);
            if let Err(e) = self.cache.activate_no_refcount(lv_name, true) {
                warn!("Failed to re-activate: lv={}, error={}", lv_name, e);
            }
        }

        Err(LvhdError::ActivationError(format!(
            "could not open '{}' after {} attempts: {}",
            path.display(),
            self.open_retry_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Close the enforced handle of `object_id`, if any.
    fn close(&mut self, object_id: &str, lv_name: &str) -> Result<()> {
        if self.open_files.remove(object_id).is_some() {
            self.cache.change_open(lv_name, -1)?;
        }
        Ok(())
    }

    /// Deactivate one tracked activation and stop tracking it.
    pub fn deactivate(
        &mut self,
        object_id: &str,
        mode: RefMode,
        persistence: Persistence,
    ) -> Result<()> {
        let key = (persistence, mode, object_id.to_string());
        let lv_name = self.activations.get(&key).cloned().ok_or_else(|| {
            LvhdError::ContractViolation(format!(
                "'{}' has no {:?} {} activation to undo",
                object_id, persistence, mode
            ))
        })?;

        self.close(object_id, &lv_name)?;
        self.cache.deactivate(&self.namespace, object_id, &lv_name, mode)?;
        self.activations.remove(&key);
        Ok(())
    }

    /// Undo every tracked activation.
    ///
    /// Never fails: each failure is logged and the rest are still undone.
    /// Returns whether everything was undone cleanly. Nothing is tracked
    /// afterwards.
    pub fn deactivate_all(&mut self) -> bool {
        let mut success = true;
        let mut undone = 0usize;
        let activations = std::mem::take(&mut self.activations);

        for ((persistence, mode, object_id), lv_name) in &activations {
            if let Err(e) = self.close(object_id, lv_name) {
                warn!(
                    "Failed to close device: ns={}, id={}, error={}",
                    self.namespace, object_id, e
                );
                success = false;
            }
            match self.cache.deactivate(&self.namespace, object_id, lv_name, *mode) {
                Ok(()) => undone += 1,
                Err(e) => {
                    warn!(
                        "Failed to roll back activation: ns={}, id={}, lv={}, persistence={:?}, error={}",
                        self.namespace, object_id, lv_name, persistence, e
                    );
                    success = false;
                }
            }
        }
        // Handles of entries removed through `remove` are still ours.
        self.open_files.clear();

        info!(
            "Rolled back activations: ns={}, undone={}, failed={}",
            self.namespace,
            undone,
            activations.len() - undone
        );
        self.events.append(
            &Event::new(EventAction::TransactionRollback)
                .with_subject(self.namespace.clone())
                .with_details(json!({"undone": undone, "success": success})),
        );
        success
    }

    /// Commit: stop tracking persistent activations so rollback leaves them.
    pub fn persist(&mut self) {
        let before = self.activations.len();
        self.activations
            .retain(|(persistence, _, _), _| *persistence != Persistence::Persistent);
        let persisted = before - self.activations.len();

        debug!("Persisted activations: ns={}, count={}", self.namespace, persisted);
        self.events.append(
            &Event::new(EventAction::TransactionPersist)
                .with_subject(self.namespace.clone())
                .with_details(json!({"persisted": persisted})),
        );
    }

    /// Move the temporary activation of `old_id` to `new_id` under
    /// `lv_name`, carrying over any open device handle.
    pub fn replace(&mut self, old_id: &str, new_id: &str, lv_name: &str, mode: RefMode) -> Result<()> {
        let old_key = (Persistence::Temporary, mode, old_id.to_string());
        if self.activations.remove(&old_key).is_none() {
            return Err(LvhdError::ContractViolation(format!(
                "'{}' has no temporary {} activation to replace",
                old_id, mode
            )));
        }
        self.activations.insert(
            (Persistence::Temporary, mode, new_id.to_string()),
            lv_name.to_string(),
        );
        if let Some(file) = self.open_files.remove(old_id) {
            self.open_files.insert(new_id.to_string(), file);
        }
        Ok(())
    }

    /// Track a temporary activation made elsewhere.
    pub fn add(&mut self, object_id: &str, lv_name: &str, mode: RefMode) {
        self.activations.insert(
            (Persistence::Temporary, mode, object_id.to_string()),
            lv_name.to_string(),
        );
    }

    /// Stop tracking a temporary activation without undoing it.
    pub fn remove(&mut self, object_id: &str, mode: RefMode) -> Option<String> {
        self.activations
            .remove(&(Persistence::Temporary, mode, object_id.to_string()))
    }

    /// Volume of the temporary activation of `object_id`.
    pub fn get(&self, object_id: &str, mode: RefMode) -> Option<&str> {
        self.activations
            .get(&(Persistence::Temporary, mode, object_id.to_string()))
            .map(String::as_str)
    }

    /// Whether an enforced handle is held for `object_id`.
    pub fn holds_open(&self, object_id: &str) -> bool {
        self.open_files.contains_key(object_id)
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Everything tracked, in rollback order.
    pub fn tracked(&self) -> Vec<TrackedActivation> {
        self.activations
            .iter()
            .map(|((persistence, mode, object_id), lv_name)| TrackedActivation {
                persistence: *persistence,
                mode: *mode,
                object_id: object_id.clone(),
                lv_name: lv_name.clone(),
            })
            .collect()
    }
}
