//! Error types for lvhd.
//!
//! Uses thiserror for derive macros. Every variant belongs to one coarse
//! [`ErrorKind`] so callers can tell lock contention, journal conflicts and
//! volume manager failures apart without matching on message text.
//!
//! Expected absence (no journal entry, no cached volume) is never an error;
//! those lookups return `Option` or an empty collection instead.

use thiserror::Error;

/// Main error type for lvhd operations.
#[derive(Error, Debug)]
pub enum LvhdError {
    /// A lock file or directory could not be created, or an OS lock call
    /// failed for a reason other than contention.
    #[error("Lock failure: {0}")]
    LockError(String),

    /// A caller broke an API contract (double lock, release when not held,
    /// double persistent activation).
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// A journal entry already exists for the given identity.
    #[error("Journal already exists for '{kind}:{id}': {existing}")]
    JournalExists {
        kind: String,
        id: String,
        existing: String,
    },

    /// No journal entry exists for the given identity.
    #[error("No journal for '{kind}:{id}'")]
    JournalMissing { kind: String, id: String },

    /// A journal entry is stored under a name that cannot be parsed.
    #[error("Corrupt journal entry: {0}")]
    JournalCorrupt(String),

    /// The volume manager reported that the volume does not exist.
    #[error("Logical volume '{name}' not found in volume group '{vg}'")]
    VolumeNotFound { vg: String, name: String },

    /// A volume manager command failed.
    #[error("Command '{command}' failed (exit code {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A volume could not be brought into the requested state.
    #[error("Activation failed: {0}")]
    ActivationError(String),

    /// Filesystem I/O failed.
    #[error("I/O failure: {0}")]
    IoError(String),

    /// Configuration could not be read or is invalid.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

/// Coarse classification of [`LvhdError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lock,
    Contract,
    Journal,
    VolumeManager,
    Activation,
    Io,
    Config,
}

impl LvhdError {
    /// Returns the class this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LvhdError::LockError(_) => ErrorKind::Lock,
            LvhdError::ContractViolation(_) => ErrorKind::Contract,
            LvhdError::JournalExists { .. }
            | LvhdError::JournalMissing { .. }
            | LvhdError::JournalCorrupt(_) => ErrorKind::Journal,
            LvhdError::VolumeNotFound { .. } | LvhdError::CommandFailed { .. } => {
                ErrorKind::VolumeManager
            }
            LvhdError::ActivationError(_) => ErrorKind::Activation,
            LvhdError::IoError(_) => ErrorKind::Io,
            LvhdError::ConfigError(_) => ErrorKind::Config,
        }
    }

    /// Returns true if the error means the volume is simply not there.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LvhdError::VolumeNotFound { .. })
    }
}

/// Result type alias for lvhd operations.
pub type Result<T> = std::result::Result<T, LvhdError>;
