//! Journaling subsystem for lvhd.
//!
//! A journal entry marks a multi-step operation (clone, coalesce, ...) on an
//! object as in progress. Entries are keyed by `(kind, id)` and carry one
//! opaque string value; the recovery pass enumerates them per kind after a
//! crash and decides how to unwind each operation.
//!
//! Two backends share the [`Journal`] contract:
//!
//! - [`FileJournaler`] keeps one file per entry, named `<kind>_<id>`, in a
//!   journal directory.
//! - [`VolumeJournaler`] keeps one logical volume per entry, tagged
//!   `journaler`, with the value in the volume name or, when it does not
//!   fit there, length-prefixed at the start of the volume.
//!
//! # Kinds and Ids
//!
//! `_` separates the parts of an entry name, so kinds never contain it. The
//! volume backend also needs the id part unambiguous; ids containing `_` are
//! only accepted by the file backend.

mod file;
mod volume;

#[cfg(test)]
mod tests;

use crate::error::{LvhdError, Result};
use crate::events::{Event, EventAction, EventLog};
use serde_json::json;
use std::collections::BTreeMap;

pub use file::FileJournaler;
pub use volume::{JOURNAL_TAG, VolumeJournaler};

/// Separator between the parts of an entry name.
const SEPARATOR: char = '_';

/// Durable record of in-progress operations.
pub trait Journal {
    /// Record `value` for `(kind, id)`.
    ///
    /// Fails with [`LvhdError::JournalExists`] if an entry is already there;
    /// the existing value is left untouched.
    fn create(&self, kind: &str, id: &str, value: &str) -> Result<()>;

    /// Delete the entry, failing with [`LvhdError::JournalMissing`] if there
    /// is none.
    fn remove(&self, kind: &str, id: &str) -> Result<()>;

    /// The entry's value, or `None` if there is no entry.
    fn get(&self, kind: &str, id: &str) -> Result<Option<String>>;

    /// Every live entry of `kind`, keyed by id.
    fn get_all(&self, kind: &str) -> Result<BTreeMap<String, String>>;

    /// Whether any kind has an entry for `id`.
    fn has_journals(&self, id: &str) -> Result<bool>;
}

fn validate_kind(kind: &str) -> Result<()> {
    if kind.is_empty() || kind.contains(SEPARATOR) || kind.contains('/') || kind.starts_with('.') {
        return Err(LvhdError::ContractViolation(format!(
            "invalid journal kind '{}'",
            kind
        )));
    }
    Ok(())
}

fn journal_exists(kind: &str, id: &str, existing: String) -> LvhdError {
    LvhdError::JournalExists {
        kind: kind.to_string(),
        id: id.to_string(),
        existing,
    }
}

fn journal_missing(kind: &str, id: &str) -> LvhdError {
    LvhdError::JournalMissing {
        kind: kind.to_string(),
        id: id.to_string(),
    }
}

fn record(events: &EventLog, action: EventAction, kind: &str, id: &str, backend: &str) {
    events.append(
        &Event::new(action)
            .with_subject(format!("{}:{}", kind, id))
            .with_details(json!({"backend": backend})),
    );
}
