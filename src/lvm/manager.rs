//! Volume manager seam and its LVM implementation.

use super::command::{CommandOutput, run_command};
use super::info::{LvInfo, mapper_name, parse_lvs_line, round_up_size, validate_lv_name};
use crate::config::Config;
use crate::error::{LvhdError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Operations on logical volumes of a named volume group.
///
/// Implementations report a missing volume as [`LvhdError::VolumeNotFound`]
/// and every other failure as [`LvhdError::CommandFailed`].
pub trait VolumeManager: Send + Sync {
    /// Every logical volume of the group with its current state.
    fn list(&self, vg: &str) -> Result<Vec<LvInfo>>;

    /// Create a volume of at least `size` bytes; returns the allocated size.
    fn create(&self, vg: &str, name: &str, size: u64, tag: Option<&str>, activate: bool)
    -> Result<u64>;

    fn remove(&self, vg: &str, name: &str) -> Result<()>;

    fn rename(&self, vg: &str, old: &str, new: &str) -> Result<()>;

    /// Resize to at least `size` bytes; returns the allocated size.
    fn resize(&self, vg: &str, name: &str, size: u64) -> Result<u64>;

    /// Activate; with `refresh`, also reload the device mapping.
    fn activate(&self, vg: &str, name: &str, refresh: bool) -> Result<()>;

    fn deactivate(&self, vg: &str, name: &str) -> Result<()>;

    fn add_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()>;

    fn remove_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()>;

    fn set_readonly(&self, vg: &str, name: &str, readonly: bool) -> Result<()>;

    /// Block device node of the volume.
    fn device_path(&self, vg: &str, name: &str) -> PathBuf;

    /// Remove a kernel mapping left behind for a volume that no longer exists.
    fn cleanup_mapping(&self, vg: &str, name: &str) -> Result<()>;
}

const LVS_SEPARATOR: char = '|';

/// [`VolumeManager`] that shells out to LVM and device-mapper tools.
#[derive(Debug, Clone)]
pub struct LvmCommands {
    /// Program and leading arguments; subcommands are appended.
    lvm: Vec<String>,
    dmsetup_binary: String,
    dev_root: PathBuf,
}

impl LvmCommands {
    /// Build from a command line such as `lvm` or `sudo -n lvm`.
    pub fn new(lvm_command: &str) -> Result<Self> {
        let lvm = shell_words::split(lvm_command).map_err(|e| {
            LvhdError::ConfigError(format!("failed to parse lvm command '{}': {}", lvm_command, e))
        })?;
        if lvm.is_empty() {
            return Err(LvhdError::ConfigError("lvm command is empty".to_string()));
        }

        Ok(Self {
            lvm,
            dmsetup_binary: "dmsetup".to_string(),
            dev_root: PathBuf::from("/dev"),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.lvm_command)
    }

    /// Run an LVM subcommand about volume `name` (if any) of `vg`.
    fn lvm(&self, vg: &str, name: Option<&str>, args: &[&str]) -> Result<CommandOutput> {
        let mut full: Vec<&str> = self.lvm[1..].iter().map(String::as_str).collect();
        full.extend_from_slice(args);

        run_command(&self.lvm[0], &full).map_err(|e| match (e, name) {
            (LvhdError::CommandFailed { stderr, .. }, Some(name))
                if is_not_found_message(&stderr) =>
            {
                LvhdError::VolumeNotFound {
                    vg: vg.to_string(),
                    name: name.to_string(),
                }
            }
            (e, _) => e,
        })
    }

    fn checked(vg: &str, name: &str) -> Result<String> {
        validate_lv_name(vg)?;
        validate_lv_name(name)?;
        Ok(format!("{}/{}", vg, name))
    }
}

/// Whether LVM's stderr says the volume does not exist.
fn is_not_found_message(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("not found")
        || stderr.contains("failed to find logical volume")
        || stderr.contains("does not exist")
}

fn size_arg(size: u64) -> String {
    format!("{}b", size)
}

impl VolumeManager for LvmCommands {
    fn list(&self, vg: &str) -> Result<Vec<LvInfo>> {
        validate_lv_name(vg)?;
        let separator = LVS_SEPARATOR.to_string();
        let output = self.lvm(
            vg,
            None,
            &[
                "lvs",
                "--noheadings",
                "--nosuffix",
                "--units",
                "b",
                "--separator",
                &separator,
                "-o",
                "lv_name,lv_size,lv_attr,lv_tags",
                vg,
            ],
        )?;

        let mut lvs = Vec::new();
        for line in output.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_lvs_line(line, LVS_SEPARATOR) {
                Some(info) => lvs.push(info),
                None => warn!("Skipping unparsable lvs line: vg={}, line={:?}", vg, line),
            }
        }
        Ok(lvs)
    }

    fn create(
        &self,
        vg: &str,
        name: &str,
        size: u64,
        tag: Option<&str>,
        activate: bool,
    ) -> Result<u64> {
        validate_lv_name(vg)?;
        validate_lv_name(name)?;
        let size = round_up_size(size);
        let size_str = size_arg(size);

        let mut args = vec!["lvcreate", "-n", name, "-L", &size_str];
        if let Some(tag) = tag {
            args.extend_from_slice(&["--addtag", tag]);
        }
        if !activate {
            args.extend_from_slice(&["-an", "--zero", "n"]);
        }
        args.push(vg);

        self.lvm(vg, None, &args)?;
        Ok(size)
    }

    fn remove(&self, vg: &str, name: &str) -> Result<()> {
        let path = Self::checked(vg, name)?;
        self.lvm(vg, Some(name), &["lvremove", "-f", &path])?;
        Ok(())
    }

    fn rename(&self, vg: &str, old: &str, new: &str) -> Result<()> {
        let path = Self::checked(vg, old)?;
        validate_lv_name(new)?;
        self.lvm(vg, Some(old), &["lvrename", &path, new])?;
        Ok(())
    }

    fn resize(&self, vg: &str, name: &str, size: u64) -> Result<u64> {
        let path = Self::checked(vg, name)?;
        let size = round_up_size(size);
        self.lvm(vg, Some(name), &["lvresize", "-L", &size_arg(size), &path])?;
        Ok(size)
    }

    fn activate(&self, vg: &str, name: &str, refresh: bool) -> Result<()> {
        let path = Self::checked(vg, name)?;
        self.lvm(vg, Some(name), &["lvchange", "-ay", &path])?;
        if refresh {
            self.lvm(vg, Some(name), &["lvchange", "--refresh", &path])?;
        }
        Ok(())
    }

    fn deactivate(&self, vg: &str, name: &str) -> Result<()> {
        let path = Self::checked(vg, name)?;
        self.lvm(vg, Some(name), &["lvchange", "-an", &path])?;
        Ok(())
    }

    fn add_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()> {
        let path = Self::checked(vg, name)?;
        self.lvm(vg, Some(name), &["lvchange", "--addtag", tag, &path])?;
        Ok(())
    }

    fn remove_tag(&self, vg: &str, name: &str, tag: &str) -> Result<()> {
        let path = Self::checked(vg, name)?;
        self.lvm(vg, Some(name), &["lvchange", "--deltag", tag, &path])?;
        Ok(())
    }

    fn set_readonly(&self, vg: &str, name: &str, readonly: bool) -> Result<()> {
        let path = Self::checked(vg, name)?;
        let permission = if readonly { "r" } else { "rw" };
        self.lvm(vg, Some(name), &["lvchange", "-p", permission, &path])?;
        Ok(())
    }

    fn device_path(&self, vg: &str, name: &str) -> PathBuf {
        self.dev_root.join(vg).join(name)
    }

    fn cleanup_mapping(&self, vg: &str, name: &str) -> Result<()> {
        let mapper = mapper_name(vg, name);
        let mapper_path = self.dev_root.join("mapper").join(&mapper);
        if mapper_path.exists() {
            debug!("Removing leftover mapping: mapper={}", mapper);
            run_command(&self.dmsetup_binary, &["remove", &mapper])?;
        }

        remove_dangling_link(&self.device_path(vg, name))
    }
}

fn remove_dangling_link(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path).map_err(|e| {
            LvhdError::IoError(format!(
                "failed to remove device link '{}': {}",
                path.display(),
                e
            ))
        }),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LvhdError::IoError(format!(
            "failed to inspect device link '{}': {}",
            path.display(),
            e
        ))),
    }
}
