//! Logical volume records and name handling.

use crate::config::types::LVM_SIZE_INCREMENT;
use crate::error::{LvhdError, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Tag marking a volume as hidden (an internal node of a disk chain).
pub const HIDDEN_TAG: &str = "hidden";

/// Characters LVM accepts in a volume or group name.
static LV_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+_.][A-Za-z0-9+_.\-]*$").expect("Invalid LV name regex"));

/// Cached view of one logical volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvInfo {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    pub active: bool,
    /// Number of known opens of the device. The volume manager only reports
    /// open/not open; holders that open the device themselves add to it.
    pub open: u32,
    pub readonly: bool,
    pub tags: BTreeSet<String>,
}

impl LvInfo {
    /// An inactive, empty record.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            active: false,
            open: 0,
            readonly: false,
            tags: BTreeSet::new(),
        }
    }

    pub fn hidden(&self) -> bool {
        self.tags.contains(HIDDEN_TAG)
    }

    pub fn is_open(&self) -> bool {
        self.open > 0
    }
}

/// Parse one line of `lvs --noheadings --nosuffix --units b --separator <sep>
/// -o lv_name,lv_size,lv_attr,lv_tags`.
///
/// Attribute positions: 1 is `r`/`R` for read-only, 4 is `a` for active,
/// 5 is `o` for open.
pub fn parse_lvs_line(line: &str, separator: char) -> Option<LvInfo> {
    let mut fields = line.trim().split(separator);
    let name = fields.next()?.trim();
    let size = fields.next()?.trim().parse::<u64>().ok()?;
    let attr: Vec<char> = fields.next()?.trim().chars().collect();
    let tags = fields.next().unwrap_or("").trim();

    if name.is_empty() || attr.len() < 6 {
        return None;
    }

    Some(LvInfo {
        name: name.to_string(),
        size,
        active: attr[4] == 'a',
        open: u32::from(attr[5] == 'o'),
        readonly: matches!(attr[1], 'r' | 'R'),
        tags: tags
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect(),
    })
}

/// Device-mapper name of a volume: `-` doubled in both parts, joined by `-`.
pub fn mapper_name(vg_name: &str, lv_name: &str) -> String {
    format!("{}-{}", vg_name.replace('-', "--"), lv_name.replace('-', "--"))
}

/// Round a size up to the volume manager's allocation increment.
pub fn round_up_size(size: u64) -> u64 {
    size.div_ceil(LVM_SIZE_INCREMENT).max(1) * LVM_SIZE_INCREMENT
}

/// Reject names the volume manager would refuse or misread as options.
pub fn validate_lv_name(name: &str) -> Result<()> {
    if name == "." || name == ".." || !LV_NAME_REGEX.is_match(name) {
        return Err(LvhdError::ContractViolation(format!(
            "invalid logical volume name '{}'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_active_open_volume() {
        let info = parse_lvs_line("  VHD-1234|8388608|-wi-ao----|vdi,hidden", '|').unwrap();
        assert_eq!(info.name, "VHD-1234");
        assert_eq!(info.size, 8388608);
        assert!(info.active);
        assert!(info.is_open());
        assert!(!info.readonly);
        assert!(info.hidden());
        assert!(info.tags.contains("vdi"));
    }

    #[test]
    fn test_parse_inactive_readonly_volume() {
        let info = parse_lvs_line("LV-ro|4194304|-ri-------|", '|').unwrap();
        assert!(!info.active);
        assert!(!info.is_open());
        assert!(info.readonly);
        assert!(info.tags.is_empty());
    }

    #[test]
    fn test_parse_without_tag_column() {
        let info = parse_lvs_line("LV-a|4194304|-wi-a-----", '|').unwrap();
        assert!(info.active);
        assert!(info.tags.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_lvs_line("", '|').is_none());
        assert!(parse_lvs_line("name|notanumber|-wi-a-----|", '|').is_none());
        assert!(parse_lvs_line("name|4194304|-wi|", '|').is_none());
    }

    #[test]
    fn test_mapper_name_doubles_dashes() {
        assert_eq!(
            mapper_name("VG_XenStorage-abc", "VHD-1"),
            "VG_XenStorage--abc-VHD--1"
        );
    }

    #[test]
    fn test_round_up_size() {
        assert_eq!(round_up_size(0), LVM_SIZE_INCREMENT);
        assert_eq!(round_up_size(1), LVM_SIZE_INCREMENT);
        assert_eq!(round_up_size(LVM_SIZE_INCREMENT), LVM_SIZE_INCREMENT);
        assert_eq!(round_up_size(LVM_SIZE_INCREMENT + 1), 2 * LVM_SIZE_INCREMENT);
    }

    #[test]
    fn test_validate_lv_name() {
        assert!(validate_lv_name("VHD-1234").is_ok());
        assert!(validate_lv_name("clone_abc_831_3").is_ok());
        assert!(validate_lv_name(".journal").is_ok());
        assert!(validate_lv_name("-ay").is_err());
        assert!(validate_lv_name("a/b").is_err());
        assert!(validate_lv_name("a b").is_err());
        assert!(validate_lv_name("").is_err());
        assert!(validate_lv_name("..").is_err());
    }
}
