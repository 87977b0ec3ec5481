//! Journal entries as files in a directory.

use super::{Journal, SEPARATOR, journal_exists, journal_missing, record, validate_kind};
use crate::config::Config;
use crate::error::{LvhdError, Result};
use crate::events::{EventAction, EventLog};
use crate::fs::{create_new_durable, remove_durable};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// [`Journal`] keeping each entry in a file `<dir>/<kind>_<id>`.
///
/// The value is the file's first line. Entries are created atomically and
/// durably; a crash never leaves a partially written entry under its final
/// name.
#[derive(Debug, Clone)]
pub struct FileJournaler {
    dir: PathBuf,
    events: EventLog,
}

impl FileJournaler {
    /// Journal in `dir`; the directory is created on the first `create`.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            events: EventLog::disabled(),
        }
    }

    /// Journal in `dir`, recording to the event log of `config`.
    pub fn from_config<P: Into<PathBuf>>(dir: P, config: &Config) -> Self {
        Self::new(dir).with_event_log(EventLog::from_path(config.event_log.as_deref()))
    }

    /// Record entry creation and removal in `events`.
    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, kind: &str, id: &str) -> Result<PathBuf> {
        validate_kind(kind)?;
        if id.is_empty() || id.contains('/') {
            return Err(LvhdError::ContractViolation(format!(
                "invalid journal id '{}'",
                id
            )));
        }
        Ok(self.dir.join(format!("{}{}{}", kind, SEPARATOR, id)))
    }

    /// Read an entry's value; `None` if the file is not (or no longer) there.
    fn read_value(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content.lines().next().unwrap_or("").to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LvhdError::IoError(format!(
                "failed to read journal '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// `(kind, id, file name)` of every entry in the directory.
    fn entries(&self) -> Result<Vec<(String, String, String)>> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LvhdError::IoError(format!(
                    "failed to list journal directory '{}': {}",
                    self.dir.display(),
                    e
                )));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| {
                LvhdError::IoError(format!(
                    "failed to list journal directory '{}': {}",
                    self.dir.display(),
                    e
                ))
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!("Skipping non UTF-8 journal file: name={:?}", file_name);
                continue;
            };
            // Temporary files of an in-flight create.
            if name.starts_with('.') {
                continue;
            }
            let Some((kind, id)) = name.split_once(SEPARATOR) else {
                return Err(LvhdError::JournalCorrupt(format!(
                    "journal file '{}' in '{}' has no kind separator",
                    name,
                    self.dir.display()
                )));
            };
            entries.push((kind.to_string(), id.to_string(), name.to_string()));
        }
        Ok(entries)
    }
}

impl Journal for FileJournaler {
    fn create(&self, kind: &str, id: &str, value: &str) -> Result<()> {
        let path = self.entry_path(kind, id)?;
        if value.contains('\n') {
            return Err(LvhdError::ContractViolation(format!(
                "journal value for '{}:{}' spans lines",
                kind, id
            )));
        }
        if let Some(existing) = Self::read_value(&path)? {
            return Err(journal_exists(kind, id, existing));
        }

        fs::create_dir_all(&self.dir).map_err(|e| {
            LvhdError::IoError(format!(
                "failed to create journal directory '{}': {}",
                self.dir.display(),
                e
            ))
        })?;

        match create_new_durable(&path, value.as_bytes()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost a race with another creator.
                let existing = Self::read_value(&path)?.unwrap_or_default();
                return Err(journal_exists(kind, id, existing));
            }
            Err(e) => {
                return Err(LvhdError::IoError(format!(
                    "failed to write journal '{}': {}",
                    path.display(),
                    e
                )));
            }
        }

        debug!("Created journal: kind={}, id={}", kind, id);
        record(&self.events, EventAction::JournalCreate, kind, id, "file");
        Ok(())
    }

    fn remove(&self, kind: &str, id: &str) -> Result<()> {
        let path = self.entry_path(kind, id)?;
        match remove_durable(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(journal_missing(kind, id)),
            Err(e) => {
                return Err(LvhdError::IoError(format!(
                    "failed to remove journal '{}': {}",
                    path.display(),
                    e
                )));
            }
        }

        debug!("Removed journal: kind={}, id={}", kind, id);
        record(&self.events, EventAction::JournalRemove, kind, id, "file");
        Ok(())
    }

    fn get(&self, kind: &str, id: &str) -> Result<Option<String>> {
        Self::read_value(&self.entry_path(kind, id)?)
    }

    fn get_all(&self, kind: &str) -> Result<BTreeMap<String, String>> {
        validate_kind(kind)?;
        let mut found = BTreeMap::new();
        for (entry_kind, id, name) in self.entries()? {
            if entry_kind != kind {
                continue;
            }
            // Removed since the listing: not live any more.
            if let Some(value) = Self::read_value(&self.dir.join(&name))? {
                found.insert(id, value);
            }
        }
        Ok(found)
    }

    fn has_journals(&self, id: &str) -> Result<bool> {
        Ok(self.entries()?.iter().any(|(_, entry_id, _)| entry_id == id))
    }
}
