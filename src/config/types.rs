//! Default values for configuration fields.

use std::path::PathBuf;

/// Size of one LVM extent increment; volume sizes are rounded up to this.
pub const LVM_SIZE_INCREMENT: u64 = 4 * 1024 * 1024;

pub(crate) fn default_lock_dir() -> PathBuf {
    PathBuf::from("/var/lock/sm")
}
pub(crate) fn default_lvm_command() -> String {
    "lvm".to_string()
}
pub(crate) fn default_lvm_namespace_prefix() -> String {
    "lvm-".to_string()
}
pub(crate) fn default_journal_volume_size() -> u64 {
    LVM_SIZE_INCREMENT
}
pub(crate) fn default_max_mapper_name_len() -> usize {
    127
}
pub(crate) fn default_open_retry_attempts() -> u32 {
    10
}
pub(crate) fn default_open_retry_interval_ms() -> u64 {
    1000
}
