//! Event logging subsystem for lvhd.
//!
//! Durable state transitions (journal entries created/removed, volumes
//! physically activated/deactivated, transactions committed or rolled back)
//! are appended to an NDJSON file, one JSON object per line, so an operator
//! reconstructing a crash can see what each host did and in which order.
//!
//! # Event Format
//!
//! Each event is a JSON object with the following fields:
//! - `ts`: RFC3339 timestamp
//! - `action`: The transition (journal_create, lv_activate, ...)
//! - `actor`: The owner string (e.g., `root@HOST`)
//! - `subject`: Optional object the event is about (volume name, journal id)
//! - `details`: Freeform object with action-specific details
//!
//! Appending is best-effort: a failed append is reported through `tracing`
//! and never surfaces to the operation that triggered it.

use crate::error::{LvhdError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Transitions that can be logged as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Journal entry written
    JournalCreate,
    /// Journal entry removed
    JournalRemove,
    /// Volume physically activated by the first refcount holder
    LvActivate,
    /// Volume physically deactivated by the last refcount holder
    LvDeactivate,
    /// Last holder released but the volume was still open
    LvDeactivateDeferred,
    /// Activation transaction committed its persistent activations
    TransactionPersist,
    /// Activation transaction rolled back
    TransactionRollback,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::JournalCreate => write!(f, "journal_create"),
            EventAction::JournalRemove => write!(f, "journal_remove"),
            EventAction::LvActivate => write!(f, "lv_activate"),
            EventAction::LvDeactivate => write!(f, "lv_deactivate"),
            EventAction::LvDeactivateDeferred => write!(f, "lv_deactivate_deferred"),
            EventAction::TransactionPersist => write!(f, "transaction_persist"),
            EventAction::TransactionRollback => write!(f, "transaction_rollback"),
        }
    }
}

/// An event record for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// RFC3339 timestamp when the event occurred.
    pub ts: DateTime<Utc>,

    /// The transition that happened.
    pub action: EventAction,

    /// The actor who performed the action (e.g., `root@HOST`).
    pub actor: String,

    /// Optional object the event is about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    /// Freeform details object with action-specific information.
    pub details: Value,
}

impl Event {
    /// Create a new event with the given action.
    pub fn new(action: EventAction) -> Self {
        Self {
            ts: Utc::now(),
            action,
            actor: get_actor_string(),
            subject: None,
            details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Set the subject for this event.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the details object for this event.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Serialize the event to a single-line JSON string.
    pub fn to_ndjson_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| LvhdError::IoError(format!("failed to serialize event to JSON: {}", e)))
    }
}

/// Get the actor string for event metadata.
fn get_actor_string() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    format!("{}@{}", user, host)
}

/// Append-only NDJSON event sink.
///
/// A disabled log (no path) accepts and drops every event, so components can
/// hold one unconditionally.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    path: Option<PathBuf>,
}

impl EventLog {
    /// Event log writing to `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Event log that drops everything.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// Build from an optional configured path.
    pub fn from_path(path: Option<&Path>) -> Self {
        Self {
            path: path.map(Path::to_path_buf),
        }
    }

    /// Path of the events file, if enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event, logging instead of failing if the write does not go through.
    pub fn append(&self, event: &Event) {
        if let Err(e) = self.try_append(event) {
            warn!("Failed to append event: action={}, error={}", event.action, e);
        }
    }

    /// Append an event to the events file.
    ///
    /// The file and its parent directory are created if they don't exist.
    /// Each append results in one line with a trailing newline, synced to disk.
    pub fn try_append(&self, event: &Event) -> Result<()> {
        let Some(events_file) = self.path.as_deref() else {
            return Ok(());
        };

        let json_line = event.to_ndjson_line()?;

        if let Some(events_dir) = events_file.parent()
            && !events_dir.as_os_str().is_empty()
            && !events_dir.exists()
        {
            fs::create_dir_all(events_dir).map_err(|e| {
                LvhdError::IoError(format!(
                    "failed to create events directory '{}': {}",
                    events_dir.display(),
                    e
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(events_file)
            .map_err(|e| {
                LvhdError::IoError(format!(
                    "failed to open events file '{}': {}",
                    events_file.display(),
                    e
                ))
            })?;

        writeln!(file, "{}", json_line).map_err(|e| {
            LvhdError::IoError(format!(
                "failed to write event to '{}': {}",
                events_file.display(),
                e
            ))
        })?;

        file.sync_all().map_err(|e| {
            LvhdError::IoError(format!(
                "failed to sync events file '{}': {}",
                events_file.display(),
                e
            ))
        })?;

        Ok(())
    }
}
