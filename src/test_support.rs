use crate::error::{LvhdError, Result};
use crate::locks::LockStore;
use crate::lvm::{LvInfo, VolumeManager, VolumeMetadataCache, round_up_size};
use crate::refcount::MemoryRefCounter;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;

/// Volume manager operations the fake counts and can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum FakeOp {
    List,
    Create,
    Remove,
    Rename,
    Resize,
    Activate,
    Deactivate,
    Tag,
    SetReadonly,
    Cleanup,
}

#[derive(Debug)]
struct Injected {
    op: FakeOp,
    name: Option<String>,
    /// The volume disappears as the failing command runs.
    vanish: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    lvs: BTreeMap<(String, String), LvInfo>,
    injected: Vec<Injected>,
    calls: HashMap<FakeOp, usize>,
}

/// In-memory volume manager.
///
/// Each volume's data lives in a sparse file under `<root>/data/<vg>/<name>`.
/// While the volume is active `<root>/dev/<vg>/<name>` is a symlink to it, so
/// opening the device path of an inactive volume fails the way it does on a
/// real host.
///
/// Clones share state, so a test can keep one handle to play the part of an
/// uncoordinated external tool while the cache holds another.
#[derive(Debug, Clone)]
pub(crate) struct FakeVolumeManager {
    state: Arc<Mutex<FakeState>>,
    root: Arc<TempDir>,
}

impl FakeVolumeManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            root: Arc::new(TempDir::new().unwrap()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn data_path(&self, vg: &str, name: &str) -> PathBuf {
        self.root.path().join("data").join(vg).join(name)
    }

    /// Make the next `op` on `name` fail.
    pub(crate) fn fail_next(&self, op: FakeOp, name: &str) {
        self.state().injected.push(Injected {
            op,
            name: Some(name.to_string()),
            vanish: false,
        });
    }

    /// Make the next `op` on any volume fail.
    pub(crate) fn fail_next_any(&self, op: FakeOp) {
        self.state().injected.push(Injected {
            op,
            name: None,
            vanish: false,
        });
    }

    /// Make the next `op` on `name` fail with the volume removed under it.
    pub(crate) fn vanish_on_next(&self, op: FakeOp, name: &str) {
        self.state().injected.push(Injected {
            op,
            name: Some(name.to_string()),
            vanish: true,
        });
    }

    /// Number of times `op` has run, including injected failures.
    pub(crate) fn calls(&self, op: FakeOp) -> usize {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Seed a volume directly, as if created by another host.
    pub(crate) fn seed(&self, vg: &str, name: &str, size: u64, active: bool) {
        let mut info = LvInfo::new(name);
        info.size = round_up_size(size);
        self.write_data_file(vg, name, info.size).unwrap();
        self.state().lvs.insert((vg.to_string(), name.to_string()), info);
        if active {
            self.set_active(vg, name, true).unwrap();
        }
    }

    /// Mark a volume open or closed by someone outside the cache.
    pub(crate) fn set_open(&self, vg: &str, name: &str, open: bool) {
        if let Some(info) = self.state().lvs.get_mut(&key(vg, name)) {
            info.open = u32::from(open);
        }
    }

    /// Deactivate a volume behind the cache's back.
    pub(crate) fn external_deactivate(&self, vg: &str, name: &str) {
        self.set_active(vg, name, false).unwrap();
    }

    /// Remove a volume behind the cache's back.
    pub(crate) fn external_remove(&self, vg: &str, name: &str) {
        self.drop_volume(vg, name);
    }

    /// Current state of a volume as the manager sees it.
    pub(crate) fn volume(&self, vg: &str, name: &str) -> Option<LvInfo> {
        self.state().lvs.get(&key(vg, name)).cloned()
    }

    pub(crate) fn is_active(&self, vg: &str, name: &str) -> bool {
        self.volume(vg, name).is_some_and(|info| info.active)
    }

    fn write_data_file(&self, vg: &str, name: &str, size: u64) -> std::io::Result<()> {
        let path = self.data_path(vg, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(size)
    }

    fn set_active(&self, vg: &str, name: &str, active: bool) -> Result<()> {
        {
            let mut state = self.state();
            let info = state
                .lvs
                .get_mut(&key(vg, name))
                .ok_or_else(|| not_found(vg, name))?;
            info.active = active;
        }

        let link = self.device_path(vg, name);
        let _ = fs::remove_file(&link);
        if active {
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).map_err(io_error)?;
            }
            std::os::unix::fs::symlink(self.data_path(vg, name), &link).map_err(io_error)?;
        }
        Ok(())
    }

    fn drop_volume(&self, vg: &str, name: &str) {
        self.state().lvs.remove(&key(vg, name));
        let _ = fs::remove_file(self.data_path(vg, name));
        // The device link is left dangling, like a mapping nobody cleaned up.
    }

    /// Count the call and fire any injected failure for it.
    fn enter(&self, op: FakeOp, vg: &str, name: Option<&str>) -> Result<()> {
        let injected = {
            let mut state = self.state();
            *state.calls.entry(op).or_insert(0) += 1;
            let pos = state.injected.iter().position(|i| {
                i.op == op && (i.name.is_none() || i.name.as_deref() == name)
            });
            pos.map(|pos| state.injected.remove(pos))
        };

        let Some(injected) = injected else {
            return Ok(());
        };
        if injected.vanish
            && let Some(name) = name
        {
            self.drop_volume(vg, name);
        }
        Err(LvhdError::CommandFailed {
            command: format!("fake {:?} {}", op, name.unwrap_or(vg)),
            code: 5,
            stderr: "injected failure".to_string(),
        })
    }

    fn existing(&self, vg: &str, name: &str) -> Result<()> {
        if self.state().lvs.contains_key(&key(vg, name)) {
            Ok(())
        } else {
            Err(not_found(vg, name))
        }
    }
}

fn key(vg: &str, name: &str) -> (String, String) {
    (vg.to_string(), name.to_string())
}

fn not_found(vg: &str, name: &str) -> LvhdError {
    LvhdError::VolumeNotFound {
        vg: vg.to_string(),
        name: name.to_string(),
    }
}

fn io_error(e: std::io::Error) -> LvhdError {
    LvhdError::IoError(e.to_string())
}

impl VolumeManager for FakeVolumeManager {
    fn list(&self, vg: &str) -> Result<Vec<LvInfo>> {
        self.enter(FakeOp::List, vg, None)?;
        Ok(self
            .state()
            .lvs
            .iter()
            .filter(|((v, _), _)| v == vg)
            .map(|(_, info)| info.clone())
            .collect())
    }

    fn create(
        &self,
        vg: &str,
        name: &str,
        size: u64,
        tag: Option<&str>,
        activate: bool,
    ) -> Result<u64> {
        self.enter(FakeOp::Create, vg, Some(name))?;
        if self.state().lvs.contains_key(&key(vg, name)) {
            return Err(LvhdError::CommandFailed {
                command: format!("fake create {}", name),
                code: 5,
                stderr: format!("Logical volume \"{}\" already exists", name),
            });
        }

        let size = round_up_size(size);
        let mut info = LvInfo::new(name);
        info.size = size;
        if let Some(tag) = tag {
            info.tags.insert(tag.to_string());
        }
        // Fresh volumes read back as zeroes.
        let _ = fs::remove_file(self.data_path(vg, name));
        self.write_data_file(vg, name, size).map_err(io_error)?;
        self.state().lvs.insert(key(vg, name), info);
        self.set_active(vg, name, activate)?;
        Ok(size)
    }

    fn remove(&self, vg: &str, name: &str) -> Result<()> {
        self.enter(FakeOp::Remove, vg, Some(name))?;
        self.existing(vg, name)?;
        let _ = fs::remove_file(self.device_path(vg, name));
        self.drop_volume(vg, name);
        Ok(())
    }

    fn rename(&self, vg: &str, old: &str, new: &str) -> Result<()> {
        self.enter(FakeOp::Rename, vg, Some(old))?;
        self.existing(vg, old)?;
        let was_active = self.is_active(vg, old);
        self.set_active(vg, old, false)?;
        fs::rename(self.data_path(vg, old), self.data_path(vg, new)).map_err(io_error)?;
        {
            let mut state = self.state();
            if let Some(mut info) = state.lvs.remove(&key(vg, old)) {
                info.name = new.to_string();
                state.lvs.insert(key(vg, new), info);
            }
        }
        self.set_active(vg, new, was_active)
    }

    fn resize(&self, vg: &str, name: &str, size: u64) -> Result<u64> {
        self.enter(FakeOp::Resize, vg, Some(name))?;
        self.existing(vg, name)?;
        let size = round_up_size(size);
        self.write_data_file(vg, name, size).map_err(io_error)?;
        if let Some(info) = self.state().lvs.get_mut(&key(vg, name)) {
            info.size = size;
        }
        Ok(size)
    }

    fn activate(&self, vg: &str, name: &str, _refresh: bool) -> Result<()> {
        self.enter(FakeOp::Activate, vg, Some(name))?;
        self.set_active(vg, name, true)
    }

    fn deactivate(&self, vg: &str, name: &str) -> Result<()> {
        self.enter(FakeOp::Deactivate, vg, Some(name))?;
        if self.volume(vg, name).is_some_and(|info| info.is_open()) {
            return Err(LvhdError::CommandFailed {
                command: format!("fake deactivate {}", name),
                code: 5,
                stderr: format!("Logical volume {}/{} in use", vg, name),
            });
        }
        self.set_active(vg, name, false)
    }

    fn add_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()> {
        self.enter(FakeOp::Tag, vg, Some(name))?;
        let mut state = self.state();
        let info = state
            .lvs
            .get_mut(&key(vg, name))
            .ok_or_else(|| not_found(vg, name))?;
        info.tags.insert(tag.to_string());
        Ok(())
    }

    fn remove_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()> {
        self.enter(FakeOp::Tag, vg, Some(name))?;
        let mut state = self.state();
        let info = state
            .lvs
            .get_mut(&key(vg, name))
            .ok_or_else(|| not_found(vg, name))?;
        info.tags.remove(tag);
        Ok(())
    }

    fn set_readonly(&self, vg: &str, name: &str, readonly: bool) -> Result<()> {
        self.enter(FakeOp::SetReadonly, vg, Some(name))?;
        let mut state = self.state();
        let info = state
            .lvs
            .get_mut(&key(vg, name))
            .ok_or_else(|| not_found(vg, name))?;
        info.readonly = readonly;
        Ok(())
    }

    fn device_path(&self, vg: &str, name: &str) -> PathBuf {
        self.root.path().join("dev").join(vg).join(name)
    }

    fn cleanup_mapping(&self, vg: &str, name: &str) -> Result<()> {
        self.enter(FakeOp::Cleanup, vg, Some(name))?;
        let link = self.device_path(vg, name);
        if fs::symlink_metadata(&link).is_ok() {
            fs::remove_file(&link).map_err(io_error)?;
        }
        Ok(())
    }
}

/// A cache over a fresh fake volume group, with everything it was built from.
pub(crate) struct CacheFixture {
    pub(crate) vg: String,
    pub(crate) manager: FakeVolumeManager,
    pub(crate) refcounter: MemoryRefCounter,
    pub(crate) locks: LockStore,
    pub(crate) cache: Arc<VolumeMetadataCache>,
    lock_dir: TempDir,
}

impl CacheFixture {
    pub(crate) fn new() -> Self {
        Self::with_manager(FakeVolumeManager::new())
    }

    /// Build over an existing fake, e.g. one pre-seeded with volumes.
    pub(crate) fn with_manager(manager: FakeVolumeManager) -> Self {
        let vg = "VG_XenStorage-test".to_string();
        let lock_dir = TempDir::new().unwrap();
        let locks = LockStore::new(lock_dir.path());
        let refcounter = MemoryRefCounter::new();
        let cache = Arc::new(VolumeMetadataCache::new(
            vg.clone(),
            Arc::new(manager.clone()),
            Arc::new(refcounter.clone()),
            locks.clone(),
        ));

        Self {
            vg,
            manager,
            refcounter,
            locks,
            cache,
            lock_dir,
        }
    }

    pub(crate) fn lock_dir(&self) -> &Path {
        self.lock_dir.path()
    }

    pub(crate) fn is_active(&self, name: &str) -> bool {
        self.manager.is_active(&self.vg, name)
    }
}
