//! Journal entries as tagged logical volumes.
//!
//! # Layout
//!
//! An entry is a volume tagged [`JOURNAL_TAG`] and named
//! `<kind>_<id>_<value>`. Values that would make the name unusable (too long
//! for a device-mapper name, or not valid in a volume name) are stored in the
//! volume itself instead, and the name ends in the marker `1`:
//!
//! ```text
//! offset 0: u32 little-endian length
//! offset 4: value bytes (UTF-8)
//! ```
//!
//! A value that is literally `1` is stored the same way so the marker is
//! never ambiguous.

use super::{Journal, SEPARATOR, journal_exists, journal_missing, record, validate_kind};
use crate::config::Config;
use crate::error::{ErrorKind, LvhdError, Result};
use crate::events::{EventAction, EventLog};
use crate::lvm::{VolumeMetadataCache, mapper_name, validate_lv_name};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tag carried by every journal volume.
pub const JOURNAL_TAG: &str = "journaler";

/// Name suffix of an entry whose value lives in the volume's data.
const DATA_MARKER: &str = "1";

const LENGTH_PREFIX: u64 = 4;

/// One parsed journal volume name.
#[derive(Debug, Clone)]
struct Entry {
    lv_name: String,
    kind: String,
    id: String,
    /// Inline value, or [`DATA_MARKER`].
    value: String,
}

impl Entry {
    fn parse(lv_name: &str) -> Result<Self> {
        let mut parts = lv_name.splitn(3, SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(id), Some(value)) => Ok(Self {
                lv_name: lv_name.to_string(),
                kind: kind.to_string(),
                id: id.to_string(),
                value: value.to_string(),
            }),
            _ => Err(LvhdError::JournalCorrupt(format!(
                "journal volume '{}' is not named <kind>_<id>_<value>",
                lv_name
            ))),
        }
    }

    fn in_data(&self) -> bool {
        self.value == DATA_MARKER
    }
}

/// [`Journal`] keeping each entry in a logical volume of the cached group.
#[derive(Debug, Clone)]
pub struct VolumeJournaler {
    cache: Arc<VolumeMetadataCache>,
    volume_size: u64,
    max_mapper_name_len: usize,
    events: EventLog,
}

impl VolumeJournaler {
    /// Journal in the group of `cache`, recording to the configured event log.
    pub fn new(cache: Arc<VolumeMetadataCache>, config: &Config) -> Self {
        Self {
            cache,
            volume_size: config.journal_volume_size,
            max_mapper_name_len: config.max_mapper_name_len,
            events: EventLog::from_path(config.event_log.as_deref()),
        }
    }

    /// Record entry creation and removal in `events`.
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> &Arc<VolumeMetadataCache> {
        &self.cache
    }

    fn validate_key(kind: &str, id: &str) -> Result<()> {
        validate_kind(kind)?;
        if id.is_empty() || id.contains(SEPARATOR) {
            return Err(LvhdError::ContractViolation(format!(
                "invalid journal id '{}'",
                id
            )));
        }
        validate_lv_name(&format!("{}{}{}", kind, SEPARATOR, id))
    }

    /// Name holding `value` inline, if the value can live there.
    fn inline_name(&self, kind: &str, id: &str, value: &str) -> Option<String> {
        if value == DATA_MARKER {
            return None;
        }
        let name = format!("{kind}{SEPARATOR}{id}{SEPARATOR}{value}");
        if validate_lv_name(&name).is_err()
            || mapper_name(self.cache.vg_name(), &name).len() > self.max_mapper_name_len
        {
            return None;
        }
        Some(name)
    }

    /// Every journal volume of the group.
    fn entries(&self) -> Result<Vec<Entry>> {
        self.cache
            .tagged(JOURNAL_TAG)?
            .iter()
            .map(|name| Entry::parse(name))
            .collect()
    }

    fn find(&self, kind: &str, id: &str) -> Result<Option<Entry>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|entry| entry.kind == kind && entry.id == id))
    }

    /// The value of an entry, reading it from the volume if needed.
    fn load(&self, entry: &Entry) -> Result<String> {
        if !entry.in_data() {
            return Ok(entry.value.clone());
        }

        self.cache.activate_no_refcount(&entry.lv_name, false)?;
        let read = read_value(&self.cache.device_path(&entry.lv_name));
        if let Err(e) = self.cache.deactivate_no_refcount(&entry.lv_name) {
            warn!(
                "Failed to deactivate journal volume: lv={}, error={}",
                entry.lv_name, e
            );
        }
        read
    }

    /// Store `value` in a freshly created data-form volume.
    fn fill(&self, lv_name: &str, value: &str) -> Result<()> {
        let written = write_value(&self.cache.device_path(lv_name), value);
        let deactivated = self.cache.deactivate_no_refcount(lv_name);
        written.and(deactivated)
    }
}

/// Read a length-prefixed value from the start of `device`.
///
/// Device nodes report no size, so the length is checked against what can
/// actually be read.
pub(super) fn read_value(device: &Path) -> Result<String> {
    let io_error = |e: std::io::Error| {
        LvhdError::IoError(format!(
            "failed to read journal volume '{}': {}",
            device.display(),
            e
        ))
    };

    let mut file = File::open(device).map_err(io_error)?;
    let len = file.read_u32::<LittleEndian>().map_err(io_error)?;

    let mut buf = Vec::new();
    file.take(u64::from(len))
        .read_to_end(&mut buf)
        .map_err(io_error)?;
    if buf.len() != len as usize {
        return Err(LvhdError::JournalCorrupt(format!(
            "journal volume '{}' claims {} bytes but holds {}",
            device.display(),
            len,
            buf.len()
        )));
    }

    String::from_utf8(buf).map_err(|_| {
        LvhdError::JournalCorrupt(format!(
            "journal volume '{}' does not hold UTF-8",
            device.display()
        ))
    })
}

fn write_value(device: &Path, value: &str) -> Result<()> {
    let io_error = |e: std::io::Error| {
        LvhdError::IoError(format!(
            "failed to write journal volume '{}': {}",
            device.display(),
            e
        ))
    };

    let len = u32::try_from(value.len()).map_err(|_| {
        LvhdError::ContractViolation(format!("journal value of {} bytes is too long", value.len()))
    })?;
    let mut file = OpenOptions::new().write(true).open(device).map_err(io_error)?;
    file.write_u32::<LittleEndian>(len).map_err(io_error)?;
    file.write_all(value.as_bytes()).map_err(io_error)?;
    file.sync_all().map_err(io_error)
}

impl Journal for VolumeJournaler {
    fn create(&self, kind: &str, id: &str, value: &str) -> Result<()> {
        Self::validate_key(kind, id)?;
        if let Some(existing) = self.get(kind, id)? {
            return Err(journal_exists(kind, id, existing));
        }

        match self.inline_name(kind, id, value) {
            Some(lv_name) => {
                self.cache
                    .create(&lv_name, self.volume_size, Some(JOURNAL_TAG), false)?;
            }
            None => {
                let lv_name = format!("{kind}{SEPARATOR}{id}{SEPARATOR}{DATA_MARKER}");
                let size = self.volume_size.max(value.len() as u64 + LENGTH_PREFIX);
                self.cache.create(&lv_name, size, Some(JOURNAL_TAG), true)?;
                if let Err(e) = self.fill(&lv_name, value) {
                    if let Err(remove_err) = self.cache.remove(&lv_name) {
                        warn!(
                            "Failed to remove half-written journal: lv={}, error={}",
                            lv_name, remove_err
                        );
                    }
                    return Err(e);
                }
            }
        }

        debug!("Created journal: kind={}, id={}", kind, id);
        record(&self.events, EventAction::JournalCreate, kind, id, "volume");
        Ok(())
    }

    fn remove(&self, kind: &str, id: &str) -> Result<()> {
        Self::validate_key(kind, id)?;
        let entry = self
            .find(kind, id)?
            .ok_or_else(|| journal_missing(kind, id))?;
        self.cache.remove(&entry.lv_name)?;

        debug!("Removed journal: kind={}, id={}", kind, id);
        record(&self.events, EventAction::JournalRemove, kind, id, "volume");
        Ok(())
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<String>> {
        Self::validate_key(kind, id)?;
        let Some(entry) = self.find(kind, id)? else {
            return Ok(None);
        };
        match self.load(&entry) {
            Ok(value) => Ok(Some(value)),
            // Removed by its owner between the listing and the read.
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Entries whose volume cannot be activated or read are left out, so one
    /// unavailable volume does not hide every other entry from recovery.
    fn get_all(&self, kind: &str) -> Result<BTreeMap<String, String>> {
        validate_kind(kind)?;
        let mut found = BTreeMap::new();
        for entry in self.entries()? {
            if entry.kind != kind {
                continue;
            }
            match self.load(&entry) {
                Ok(value) => {
                    found.insert(entry.id, value);
                }
                Err(e) if matches!(e.kind(), ErrorKind::Io | ErrorKind::VolumeManager) => warn!(
                    "Skipping unreadable journal: lv={}, error={}",
                    entry.lv_name, e
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    fn has_journals(&self, id: &str) -> Result<bool> {
        Ok(self.entries()?.iter().any(|entry| entry.id == id))
    }
}
