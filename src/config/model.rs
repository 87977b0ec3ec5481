//! Config struct definition and default implementation.

use super::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for lvhd components.
///
/// Unknown fields in the YAML are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // =========================================================================
    // Lock settings
    // =========================================================================
    /// Base directory for advisory lock files, one subdirectory per namespace.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    // =========================================================================
    // Volume manager settings
    // =========================================================================
    /// Command line invoking the LVM multiplexer (split with shell rules,
    /// e.g. `lvm` or `sudo -n lvm`); subcommands such as `lvs` are appended.
    #[serde(default = "default_lvm_command")]
    pub lvm_command: String,

    /// Prefix of the lock/refcount namespace used by activators (`lvm-<sr>`).
    #[serde(default = "default_lvm_namespace_prefix")]
    pub lvm_namespace_prefix: String,

    /// Longest device-mapper name the volume manager accepts.
    #[serde(default = "default_max_mapper_name_len")]
    pub max_mapper_name_len: usize,

    // =========================================================================
    // Journal settings
    // =========================================================================
    /// Size in bytes of each journal volume.
    #[serde(default = "default_journal_volume_size")]
    pub journal_volume_size: u64,

    // =========================================================================
    // Activation settings
    // =========================================================================
    /// How many times an enforced activation tries to open the device node.
    #[serde(default = "default_open_retry_attempts")]
    pub open_retry_attempts: u32,

    /// Pause between device open attempts, in milliseconds.
    #[serde(default = "default_open_retry_interval_ms")]
    pub open_retry_interval_ms: u64,

    // =========================================================================
    // Event log
    // =========================================================================
    /// Optional NDJSON file receiving state transition events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,
}

impl Config {
    /// Pause between device open attempts.
    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            lvm_command: default_lvm_command(),
            lvm_namespace_prefix: default_lvm_namespace_prefix(),
            max_mapper_name_len: default_max_mapper_name_len(),
            journal_volume_size: default_journal_volume_size(),
            open_retry_attempts: default_open_retry_attempts(),
            open_retry_interval_ms: default_open_retry_interval_ms(),
            event_log: None,
        }
    }
}
