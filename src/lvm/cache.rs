//! In-memory inventory of a volume group and the refcounted activation
//! protocol.
//!
//! The inventory is loaded on first use and then kept in step with reality by
//! applying each mutation to both the volume manager and the record. It is
//! never authoritative: decisions to physically activate or deactivate are
//! taken under the per-object advisory lock and re-checked against a fresh
//! listing when the cached state says something surprising.

use super::info::{HIDDEN_TAG, LvInfo};
use super::manager::VolumeManager;
use crate::config::Config;
use crate::error::{LvhdError, Result};
use crate::events::{Event, EventAction, EventLog};
use crate::locks::LockStore;
use crate::refcount::{RefCounter, RefMode};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Inventory {
    initialized: bool,
    lvs: BTreeMap<String, LvInfo>,
    /// tag -> names of volumes carrying it
    tags: BTreeMap<String, BTreeSet<String>>,
}

impl Inventory {
    fn load(&mut self, lvs: Vec<LvInfo>) {
        self.lvs.clear();
        self.tags.clear();
        for info in lvs {
            self.insert(info);
        }
        self.initialized = true;
    }

    fn insert(&mut self, info: LvInfo) {
        for tag in &info.tags {
            self.tags
                .entry(tag.clone())
                .or_default()
                .insert(info.name.clone());
        }
        self.lvs.insert(info.name.clone(), info);
    }

    fn remove(&mut self, name: &str) -> Option<LvInfo> {
        let info = self.lvs.remove(name)?;
        for tag in &info.tags {
            self.unindex(tag, name);
        }
        Some(info)
    }

    fn add_tag(&mut self, name: &str, tag: &str) {
        if let Some(info) = self.lvs.get_mut(name) {
            info.tags.insert(tag.to_string());
            self.tags
                .entry(tag.to_string())
                .or_default()
                .insert(name.to_string());
        }
    }

    fn remove_tag(&mut self, name: &str, tag: &str) {
        if let Some(info) = self.lvs.get_mut(name) {
            info.tags.remove(tag);
        }
        self.unindex(tag, name);
    }

    fn unindex(&mut self, tag: &str, name: &str) {
        if let Some(names) = self.tags.get_mut(tag) {
            names.remove(name);
            if names.is_empty() {
                self.tags.remove(tag);
            }
        }
    }

    fn scanned_index(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for info in self.lvs.values() {
            for tag in &info.tags {
                index.entry(tag.clone()).or_default().insert(info.name.clone());
            }
        }
        index
    }
}

/// Cached view of one volume group plus refcounted activation.
///
/// Cheap to share behind an `Arc`; the inventory is guarded internally and the
/// guard is never held while waiting for an advisory lock.
pub struct VolumeMetadataCache {
    vg_name: String,
    manager: Arc<dyn VolumeManager>,
    refcounter: Arc<dyn RefCounter>,
    locks: LockStore,
    events: EventLog,
    inventory: Mutex<Inventory>,
}

impl std::fmt::Debug for VolumeMetadataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeMetadataCache")
            .field("vg_name", &self.vg_name)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl VolumeMetadataCache {
    /// Uninitialized cache of `vg_name`; the first operation loads it.
    pub fn new(
        vg_name: impl Into<String>,
        manager: Arc<dyn VolumeManager>,
        refcounter: Arc<dyn RefCounter>,
        locks: LockStore,
    ) -> Self {
        Self {
            vg_name: vg_name.into(),
            manager,
            refcounter,
            locks,
            events: EventLog::disabled(),
            inventory: Mutex::new(Inventory::default()),
        }
    }

    /// Cache of `vg_name` with the lock directory and event log of `config`.
    pub fn from_config(
        vg_name: impl Into<String>,
        manager: Arc<dyn VolumeManager>,
        refcounter: Arc<dyn RefCounter>,
        config: &Config,
    ) -> Self {
        Self::new(vg_name, manager, refcounter, LockStore::from_config(config))
            .with_event_log(EventLog::from_path(config.event_log.as_deref()))
    }

    /// Record activation transitions in `events`.
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn vg_name(&self) -> &str {
        &self.vg_name
    }

    pub fn event_log(&self) -> &EventLog {
        &self.events
    }

    /// Whether the inventory has been loaded.
    pub fn is_initialized(&self) -> bool {
        self.inventory().initialized
    }

    /// Block device node of a volume.
    pub fn device_path(&self, name: &str) -> PathBuf {
        self.manager.device_path(&self.vg_name, name)
    }

    fn inventory(&self) -> MutexGuard<'_, Inventory> {
        self.inventory.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// The inventory, loading it first if this cache has never been filled.
    fn ready(&self) -> Result<MutexGuard<'_, Inventory>> {
        let mut inventory = self.inventory();
        if !inventory.initialized {
            self.reload(&mut inventory)?;
        }
        Ok(inventory)
    }

    fn reload(&self, inventory: &mut Inventory) -> Result<()> {
        let lvs = self.manager.list(&self.vg_name)?;
        debug!("Refreshed volume cache: vg={}, volumes={}", self.vg_name, lvs.len());
        inventory.load(lvs);
        Ok(())
    }

    fn not_found(&self, name: &str) -> LvhdError {
        LvhdError::VolumeNotFound {
            vg: self.vg_name.clone(),
            name: name.to_string(),
        }
    }

    /// Re-read the whole volume group, discarding everything cached.
    pub fn refresh(&self) -> Result<()> {
        let mut inventory = self.inventory();
        self.reload(&mut inventory)
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Create a volume and record it, active unless `activate` is false.
    pub fn create(&self, name: &str, size: u64, tag: Option<&str>, activate: bool) -> Result<()> {
        let mut inventory = self.ready()?;
        let size = self.manager.create(&self.vg_name, name, size, tag, activate)?;

        let mut info = LvInfo::new(name);
        info.size = size;
        info.active = activate;
        if let Some(tag) = tag {
            info.tags.insert(tag.to_string());
        }
        inventory.insert(info);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut inventory = self.ready()?;
        self.manager.remove(&self.vg_name, name)?;
        inventory.remove(name);
        Ok(())
    }

    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let mut inventory = self.ready()?;
        self.manager.rename(&self.vg_name, old, new)?;
        if let Some(mut info) = inventory.remove(old) {
            info.name = new.to_string();
            inventory.insert(info);
        }
        Ok(())
    }

    pub fn set_size(&self, name: &str, size: u64) -> Result<()> {
        let mut inventory = self.ready()?;
        let size = self.manager.resize(&self.vg_name, name, size)?;
        if let Some(info) = inventory.lvs.get_mut(name) {
            info.size = size;
        }
        Ok(())
    }

    pub fn add_tag(&self, name: &str, tag: &str) -> Result<()> {
        let mut inventory = self.ready()?;
        self.manager.add_tag(&self.vg_name, name, tag)?;
        inventory.add_tag(name, tag);
        Ok(())
    }

    pub fn remove_tag(&self, name: &str, tag: &str) -> Result<()> {
        let mut inventory = self.ready()?;
        self.manager.remove_tag(&self.vg_name, name, tag)?;
        inventory.remove_tag(name, tag);
        Ok(())
    }

    pub fn set_hidden(&self, name: &str, hidden: bool) -> Result<()> {
        if hidden {
            self.add_tag(name, HIDDEN_TAG)
        } else {
            self.remove_tag(name, HIDDEN_TAG)
        }
    }

    /// Set the read-only flag; no command is run if it already matches.
    pub fn set_readonly(&self, name: &str, readonly: bool) -> Result<()> {
        let mut inventory = self.ready()?;
        let current = inventory
            .lvs
            .get(name)
            .map(|info| info.readonly)
            .ok_or_else(|| self.not_found(name))?;
        if current == readonly {
            return Ok(());
        }

        self.manager.set_readonly(&self.vg_name, name, readonly)?;
        if let Some(info) = inventory.lvs.get_mut(name) {
            info.readonly = readonly;
        }
        Ok(())
    }

    /// Adjust the recorded open count. Never touches the device.
    pub fn change_open(&self, name: &str, delta: i32) -> Result<()> {
        let mut inventory = self.ready()?;
        let info = inventory
            .lvs
            .get_mut(name)
            .ok_or_else(|| self.not_found(name))?;
        info.open = info.open.saturating_add_signed(delta);
        Ok(())
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Activate without locking or refcounting.
    pub fn activate_no_refcount(&self, name: &str, refresh: bool) -> Result<()> {
        let mut inventory = self.ready()?;
        self.manager.activate(&self.vg_name, name, refresh)?;
        if let Some(info) = inventory.lvs.get_mut(name) {
            info.active = true;
        }
        Ok(())
    }

    /// Deactivate without locking or refcounting.
    ///
    /// A volume that no longer exists is not an error: any kernel mapping it
    /// left behind is cleaned up on a best-effort basis.
    pub fn deactivate_no_refcount(&self, name: &str) -> Result<()> {
        let mut inventory = self.ready()?;

        if inventory.lvs.contains_key(name) {
            match self.manager.deactivate(&self.vg_name, name) {
                Ok(()) => {
                    if let Some(info) = inventory.lvs.get_mut(name) {
                        info.active = false;
                    }
                    return Ok(());
                }
                Err(e) if e.is_not_found() => {
                    inventory.remove(name);
                }
                Err(e) => return Err(e),
            }
        }

        info!("Deactivating absent volume: vg={}, lv={}", self.vg_name, name);
        if let Err(e) = self.manager.cleanup_mapping(&self.vg_name, name) {
            warn!(
                "Failed to clean up mapping: vg={}, lv={}, error={}",
                self.vg_name, name, e
            );
        }
        Ok(())
    }

    /// Take a reference on `ref_id` in `namespace` and activate `name` if this
    /// is the first one.
    ///
    /// If the volume cannot be activated the reference is given back.
    pub fn activate(&self, namespace: &str, ref_id: &str, name: &str, mode: RefMode) -> Result<()> {
        let mut lock = self.locks.lock(ref_id, Some(namespace))?;
        let _guard = lock.guard()?;

        let count = self.refcounter.get(ref_id, mode, namespace)?;
        debug!(
            "Refcount up: ns={}, ref={}, mode={}, count={}",
            namespace, ref_id, mode, count
        );
        if count != 1 {
            return Ok(());
        }

        if let Err(e) = self.activate_no_refcount(name, false) {
            if let Err(put_err) = self.refcounter.put(ref_id, mode, namespace) {
                warn!(
                    "Failed to roll back refcount: ns={}, ref={}, error={}",
                    namespace, ref_id, put_err
                );
            }
            return Err(e);
        }

        self.record(EventAction::LvActivate, name, namespace, ref_id);
        Ok(())
    }

    /// Drop a reference on `ref_id` in `namespace` and deactivate `name` once
    /// no reference remains.
    ///
    /// A volume still open after a fresh listing is left active. If the
    /// deactivation itself fails and the volume is still active afterwards,
    /// the reference is restored and the error returned.
    pub fn deactivate(&self, namespace: &str, ref_id: &str, name: &str, mode: RefMode) -> Result<()> {
        let mut lock = self.locks.lock(ref_id, Some(namespace))?;
        let _guard = lock.guard()?;

        let count = self.refcounter.put(ref_id, mode, namespace)?;
        debug!(
            "Refcount down: ns={}, ref={}, mode={}, count={}",
            namespace, ref_id, mode, count
        );
        if count > 0 {
            return Ok(());
        }

        let mut refreshed = false;
        loop {
            match self.lv_info(name)? {
                None if !refreshed => {
                    self.refresh()?;
                    refreshed = true;
                }
                None => return Err(self.not_found(name)),
                Some(info) if info.is_open() && !refreshed => {
                    self.refresh()?;
                    refreshed = true;
                }
                Some(info) if info.is_open() => {
                    warn!(
                        "Skipping deactivate, volume still open: vg={}, lv={}, open={}",
                        self.vg_name, name, info.open
                    );
                    self.record(EventAction::LvDeactivateDeferred, name, namespace, ref_id);
                    return Ok(());
                }
                Some(_) => break,
            }
        }

        let err = match self.deactivate_no_refcount(name) {
            Ok(()) => {
                self.record(EventAction::LvDeactivate, name, namespace, ref_id);
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(
            "Volume could not be deactivated: vg={}, lv={}, error={}",
            self.vg_name, name, err
        );
        let still_active = match self.refresh() {
            Ok(()) => match self.lv_info(name)? {
                None => {
                    info!("Volume vanished during deactivate: vg={}, lv={}", self.vg_name, name);
                    return Ok(());
                }
                Some(info) => info.active,
            },
            Err(refresh_err) => {
                warn!("Failed to refresh after deactivate failure: error={}", refresh_err);
                true
            }
        };

        if still_active {
            warn!("Reverting the refcount change: ns={}, ref={}", namespace, ref_id);
            if let Err(get_err) = self.refcounter.get(ref_id, mode, namespace) {
                warn!(
                    "Failed to restore refcount: ns={}, ref={}, error={}",
                    namespace, ref_id, get_err
                );
            }
        }
        Err(err)
    }

    fn record(&self, action: EventAction, name: &str, namespace: &str, ref_id: &str) {
        self.events.append(
            &Event::new(action)
                .with_subject(name)
                .with_details(json!({"vg": self.vg_name, "ns": namespace, "ref": ref_id})),
        );
    }

    // =========================================================================
    // Queries (cached state only)
    // =========================================================================

    /// Whether the volume is known.
    pub fn check_lv(&self, name: &str) -> Result<bool> {
        Ok(self.ready()?.lvs.contains_key(name))
    }

    pub fn lv_info(&self, name: &str) -> Result<Option<LvInfo>> {
        Ok(self.ready()?.lvs.get(name).cloned())
    }

    /// Snapshot of every known volume.
    pub fn all_lv_info(&self) -> Result<BTreeMap<String, LvInfo>> {
        Ok(self.ready()?.lvs.clone())
    }

    pub fn size(&self, name: &str) -> Result<Option<u64>> {
        Ok(self.ready()?.lvs.get(name).map(|info| info.size))
    }

    pub fn hidden(&self, name: &str) -> Result<Option<bool>> {
        Ok(self.ready()?.lvs.get(name).map(LvInfo::hidden))
    }

    /// Names of the volumes carrying `tag`, in name order.
    pub fn tagged(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self
            .ready()?
            .tags
            .get(tag)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Whether the tag index matches what a full scan of the records gives.
    pub fn tag_index_consistent(&self) -> bool {
        let inventory = self.inventory();
        inventory.tags == inventory.scanned_index()
    }
}
