//! Tests for both journal backends.

use super::*;
use crate::config::Config;
use crate::error::ErrorKind;
use crate::test_support::{CacheFixture, FakeOp};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn create_file_journal() -> (TempDir, FileJournaler) {
    let temp_dir = TempDir::new().unwrap();
    let journal = FileJournaler::new(temp_dir.path().join("journal"));
    (temp_dir, journal)
}

fn create_volume_journal() -> (CacheFixture, VolumeJournaler) {
    let fx = CacheFixture::new();
    let journal = VolumeJournaler::new(fx.cache.clone(), &Config::default());
    (fx, journal)
}

/// The lifecycle every backend must follow.
fn check_lifecycle(journal: &dyn Journal) {
    assert_eq!(journal.get("clone", "1").unwrap(), None);

    journal.create("clone", "1", "a").unwrap();
    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("a"));

    let err = journal.create("clone", "1", "b").unwrap_err();
    assert!(matches!(
        &err,
        LvhdError::JournalExists { existing, .. } if existing == "a"
    ));
    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("a"));

    journal.remove("clone", "1").unwrap();
    assert_eq!(journal.get("clone", "1").unwrap(), None);

    let err = journal.remove("clone", "1").unwrap_err();
    assert!(matches!(err, LvhdError::JournalMissing { .. }));
    assert_eq!(err.kind(), ErrorKind::Journal);
}

fn check_enumeration(journal: &dyn Journal) {
    journal.create("coalesce", "X", "831_3").unwrap();
    journal.create("coalesce", "Y", "53_0").unwrap();
    journal.create("clone", "X", "base").unwrap();

    let all = journal.get_all("coalesce").unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["X"], "831_3");
    assert_eq!(all["Y"], "53_0");

    journal.remove("coalesce", "X").unwrap();
    let all = journal.get_all("coalesce").unwrap();
    assert_eq!(all, BTreeMap::from([("Y".to_string(), "53_0".to_string())]));

    assert!(journal.has_journals("X").unwrap());
    assert!(journal.has_journals("Y").unwrap());
    assert!(!journal.has_journals("Z").unwrap());
    assert!(journal.get_all("relink").unwrap().is_empty());
}

// =========================================================================
// File backend
// =========================================================================

#[test]
fn test_file_lifecycle() {
    let (_temp_dir, journal) = create_file_journal();
    check_lifecycle(&journal);
}

#[test]
fn test_file_enumeration() {
    let (_temp_dir, journal) = create_file_journal();
    check_enumeration(&journal);
}

#[test]
fn test_file_layout() {
    let (_temp_dir, journal) = create_file_journal();
    journal.create("clone", "1234-abcd", "parent_uuid").unwrap();

    let path = journal.dir().join("clone_1234-abcd");
    assert_eq!(fs::read_to_string(&path).unwrap(), "parent_uuid");
    // No temporary files left behind.
    assert_eq!(fs::read_dir(journal.dir()).unwrap().count(), 1);
}

#[test]
fn test_file_value_is_first_line() {
    let (_temp_dir, journal) = create_file_journal();
    fs::create_dir_all(journal.dir()).unwrap();
    fs::write(journal.dir().join("clone_1"), "a\ntrailing\n").unwrap();

    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("a"));
    assert!(journal.create("clone", "2", "a\nb").is_err());
}

#[test]
fn test_file_missing_directory_is_empty() {
    let (_temp_dir, journal) = create_file_journal();

    assert!(journal.get_all("clone").unwrap().is_empty());
    assert!(!journal.has_journals("1").unwrap());
    assert!(!journal.dir().exists());
}

#[test]
fn test_file_kinds_sharing_a_prefix_stay_apart() {
    let (_temp_dir, journal) = create_file_journal();
    journal.create("clone", "1", "a").unwrap();
    journal.create("cloneX", "2", "b").unwrap();

    let all = journal.get_all("clone").unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all["1"], "a");
}

#[test]
fn test_file_ids_may_contain_separator() {
    let (_temp_dir, journal) = create_file_journal();
    journal.create("clone", "a_b", "v").unwrap();

    assert_eq!(journal.get_all("clone").unwrap()["a_b"], "v");
}

#[test]
fn test_file_skips_temporary_files() {
    let (_temp_dir, journal) = create_file_journal();
    journal.create("clone", "1", "a").unwrap();
    fs::write(journal.dir().join(".clone_2.999.tmp"), "partial").unwrap();

    assert_eq!(journal.get_all("clone").unwrap().len(), 1);
}

#[test]
fn test_file_unparsable_name_is_corrupt() {
    let (_temp_dir, journal) = create_file_journal();
    journal.create("clone", "1", "a").unwrap();
    fs::write(journal.dir().join("garbage"), "x").unwrap();

    let err = journal.get_all("clone").unwrap_err();
    assert!(matches!(err, LvhdError::JournalCorrupt(_)));
}

#[test]
fn test_file_rejects_bad_keys() {
    let (_temp_dir, journal) = create_file_journal();

    assert!(journal.create("clo_ne", "1", "a").is_err());
    assert!(journal.create("clone", "", "a").is_err());
    assert!(journal.create("clone", "../x", "a").is_err());
    assert!(journal.get_all("").is_err());
}

#[test]
fn test_file_transitions_are_logged() {
    let (temp_dir, journal) = create_file_journal();
    let events_path = temp_dir.path().join("events.ndjson");
    let journal = journal.with_event_log(EventLog::new(&events_path));

    journal.create("clone", "1", "a").unwrap();
    journal.remove("clone", "1").unwrap();

    let content = fs::read_to_string(&events_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"journal_create\""));
    assert!(lines[0].contains("\"clone:1\""));
    assert!(lines[1].contains("\"journal_remove\""));
}

#[test]
fn test_file_journal_records_to_configured_event_log() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        event_log: Some(temp_dir.path().join("events.ndjson")),
        ..Config::default()
    };
    let journal = FileJournaler::from_config(temp_dir.path().join("journal"), &config);

    journal.create("clone", "1", "a").unwrap();

    let content = fs::read_to_string(temp_dir.path().join("events.ndjson")).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("\"journal_create\""));
}

// =========================================================================
// Volume backend
// =========================================================================

#[test]
fn test_volume_lifecycle() {
    let (_fx, journal) = create_volume_journal();
    check_lifecycle(&journal);
}

#[test]
fn test_volume_enumeration() {
    let (_fx, journal) = create_volume_journal();
    check_enumeration(&journal);
}

#[test]
fn test_volume_inline_value_needs_no_activation() {
    let (fx, journal) = create_volume_journal();
    journal.create("clone", "1", "a").unwrap();

    let info = fx.manager.volume(&fx.vg, "clone_1_a").unwrap();
    assert!(!info.active);
    assert!(info.tags.contains(JOURNAL_TAG));
    assert_eq!(info.size, Config::default().journal_volume_size);

    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("a"));
    assert_eq!(fx.manager.calls(FakeOp::Activate), 0);
}

#[test]
fn test_volume_value_in_data_when_name_cannot_hold_it() {
    let (fx, journal) = create_volume_journal();
    let long = "p".repeat(200);

    journal.create("clone", "1", "a/b c").unwrap();
    journal.create("clone", "2", &long).unwrap();

    assert!(fx.manager.volume(&fx.vg, "clone_1_1").is_some());
    assert!(fx.manager.volume(&fx.vg, "clone_2_1").is_some());
    assert!(!fx.is_active("clone_1_1"));

    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("a/b c"));
    assert_eq!(journal.get("clone", "2").unwrap().as_deref(), Some(long.as_str()));
    // Read, then put back the way it was.
    assert!(!fx.is_active("clone_2_1"));
}

#[test]
fn test_volume_literal_marker_value_round_trips() {
    let (fx, journal) = create_volume_journal();
    journal.create("clone", "1", "1").unwrap();

    assert!(fx.manager.volume(&fx.vg, "clone_1_1").is_some());
    assert_eq!(journal.get("clone", "1").unwrap().as_deref(), Some("1"));
}

#[test]
fn test_volume_mapper_name_limit_from_config() {
    let fx = CacheFixture::new();
    let config = Config {
        max_mapper_name_len: 40,
        ..Config::default()
    };
    let journal = VolumeJournaler::new(fx.cache.clone(), &config);

    // "VG_XenStorage--test-clone_1_" is 28 characters.
    journal.create("clone", "1", "short").unwrap();
    journal.create("clone", "2", "much-longer-value").unwrap();

    assert!(fx.manager.volume(&fx.vg, "clone_1_short").is_some());
    assert!(fx.manager.volume(&fx.vg, "clone_2_1").is_some());
    assert_eq!(
        journal.get("clone", "2").unwrap().as_deref(),
        Some("much-longer-value")
    );
}

#[test]
fn test_volume_unreadable_entry_is_skipped() {
    let (fx, journal) = create_volume_journal();
    journal.create("coalesce", "X", "a/b").unwrap();
    journal.create("coalesce", "Y", "53_0").unwrap();
    fx.manager.fail_next(FakeOp::Activate, "coalesce_X_1");

    let all = journal.get_all("coalesce").unwrap();

    assert_eq!(all.len(), 1);
    assert_eq!(all["Y"], "53_0");
    // Still there for the next pass.
    assert_eq!(journal.get("coalesce", "X").unwrap().as_deref(), Some("a/b"));
}

#[test]
fn test_volume_vanished_entry_reads_as_absent() {
    let (fx, journal) = create_volume_journal();
    journal.create("clone", "1", "a/b").unwrap();
    fx.manager.external_remove(&fx.vg, "clone_1_1");

    assert_eq!(journal.get("clone", "1").unwrap(), None);
    assert!(journal.get_all("clone").unwrap().is_empty());
}

#[test]
fn test_volume_failed_fill_removes_volume() {
    let (fx, journal) = create_volume_journal();
    fx.manager.fail_next(FakeOp::Deactivate, "clone_1_1");

    assert!(journal.create("clone", "1", "a/b").is_err());

    assert!(fx.manager.volume(&fx.vg, "clone_1_1").is_none());
    assert_eq!(journal.get("clone", "1").unwrap(), None);
}

#[test]
fn test_volume_unparsable_name_is_corrupt() {
    let (fx, journal) = create_volume_journal();
    fx.cache.create("bogus", 1, Some(JOURNAL_TAG), false).unwrap();

    let err = journal.get_all("clone").unwrap_err();
    assert!(matches!(err, LvhdError::JournalCorrupt(_)));
}

#[test]
fn test_volume_rejects_ids_with_separator() {
    let (_fx, journal) = create_volume_journal();

    assert!(journal.create("clone", "a_b", "v").is_err());
    assert!(journal.create("clone", "a/b", "v").is_err());
}

#[test]
fn test_volume_ignores_untagged_volumes() {
    let (fx, journal) = create_volume_journal();
    fx.cache.create("clone_9_x", 1, None, false).unwrap();

    assert!(journal.get_all("clone").unwrap().is_empty());
    assert!(!journal.has_journals("9").unwrap());
}

#[test]
fn test_volume_value_reads_from_device_node() {
    // Device nodes report a size of zero; a zero length prefix is an empty
    // value, not a truncated one.
    assert_eq!(super::volume::read_value(Path::new("/dev/zero")).unwrap(), "");
}

#[test]
fn test_volume_value_shorter_than_prefix_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("device");
    let mut data = 10u32.to_le_bytes().to_vec();
    data.extend_from_slice(b"abc");
    fs::write(&path, data).unwrap();

    let err = super::volume::read_value(&path).unwrap_err();
    assert!(matches!(err, LvhdError::JournalCorrupt(_)));
}

#[test]
fn test_volume_journal_records_to_configured_event_log() {
    let temp_dir = TempDir::new().unwrap();
    let events_path = temp_dir.path().join("events.ndjson");
    let config = Config {
        event_log: Some(events_path.clone()),
        ..Config::default()
    };
    let fx = CacheFixture::new();
    let journal = VolumeJournaler::new(fx.cache.clone(), &config);

    journal.create("clone", "1", "a").unwrap();
    journal.remove("clone", "1").unwrap();

    let content = fs::read_to_string(&events_path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"journal_create\""));
    assert!(lines[1].contains("\"journal_remove\""));
}
