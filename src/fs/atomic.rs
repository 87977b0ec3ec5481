//! Atomic filesystem operations for lvhd.
//!
//! # Implementation Strategy
//!
//! `create_new_durable` follows this pattern:
//! 1. Write content to a temporary file in the same directory
//! 2. Sync the file to disk (fsync)
//! 3. Publish it with `link()`, which fails with `EEXIST` if the target exists
//! 4. Unlink the temporary name and sync the directory
//!
//! Unlike `rename()`, `link()` never replaces an existing entry, so two
//! processes racing to create the same entry cannot both succeed.
//!
//! # Important Notes
//!
//! - On crash, a temporary file may remain (named `.{filename}.{pid}.tmp`)
//! - The temporary file is created in the same directory as the target file

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Atomically create `path` holding `content`.
///
/// # Returns
///
/// * `Ok(())` - The file now exists with exactly `content`
/// * `Err(e)` with `e.kind() == AlreadyExists` - Another entry holds the name; it is untouched
/// * `Err(e)` - Any other write, sync or link failure
pub fn create_new_durable<P: AsRef<Path>>(path: P, content: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let temp_path = generate_temp_path(path)?;

    write_and_sync(&temp_path, content)?;

    let linked = fs::hard_link(&temp_path, path);
    let _ = fs::remove_file(&temp_path);
    linked?;

    sync_parent(path);
    Ok(())
}

/// Remove `path` and sync its directory so the removal survives a crash.
pub fn remove_durable<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path = path.as_ref();
    fs::remove_file(path)?;
    sync_parent(path);
    Ok(())
}

/// Generate a temporary file path in the same directory as the target.
fn generate_temp_path(target: &Path) -> io::Result<PathBuf> {
    let parent = target.parent().unwrap_or(Path::new("."));
    let filename = target.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid file path '{}'", target.display()),
        )
    })?;

    // The pid keeps concurrent creators from sharing a temp file.
    let temp_name = format!(".{}.{}.tmp", filename, std::process::id());
    Ok(parent.join(temp_name))
}

/// Write content to a file and sync to disk.
fn write_and_sync(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;

    let written = file.write_all(content).and_then(|()| file.sync_all());
    if written.is_err() {
        let _ = fs::remove_file(path);
    }
    written
}

/// Best-effort fsync of the directory holding `path`.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
