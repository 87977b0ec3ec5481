//! Config loading, validation, and utility operations.

use super::model::Config;
use crate::error::{LvhdError, Result};
use std::path::Path;

/// Shortest mapper limit that still fits a VG name, separator and LV name.
const MIN_MAPPER_NAME_LEN: usize = 16;

impl Config {
    /// Load config from a YAML file.
    ///
    /// Unknown fields in the YAML are silently ignored for forward compatibility.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully loaded and validated config
    /// * `Err(LvhdError::ConfigError)` - Read error, parse error or validation failure
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            LvhdError::ConfigError(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| LvhdError::ConfigError(format!("failed to parse config YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| {
            LvhdError::ConfigError(format!("failed to serialize config to YAML: {}", e))
        })
    }

    /// Validate config values and return error on invalid values.
    ///
    /// Validation rules:
    /// - `lock_dir` must be absolute
    /// - `lvm_command` must split into at least one word
    /// - `journal_volume_size` and `open_retry_attempts` must be positive
    /// - `max_mapper_name_len` must leave room for a real name
    pub fn validate(&self) -> Result<()> {
        if !self.lock_dir.is_absolute() {
            return Err(LvhdError::ConfigError(format!(
                "lock_dir must be an absolute path (found '{}')",
                self.lock_dir.display()
            )));
        }

        match shell_words::split(&self.lvm_command) {
            Ok(words) if !words.is_empty() => {}
            Ok(_) => {
                return Err(LvhdError::ConfigError(
                    "lvm_command must not be empty".to_string(),
                ));
            }
            Err(e) => {
                return Err(LvhdError::ConfigError(format!(
                    "lvm_command '{}' cannot be parsed: {}",
                    self.lvm_command, e
                )));
            }
        }

        if self.journal_volume_size == 0 {
            return Err(LvhdError::ConfigError(
                "journal_volume_size must be greater than 0".to_string(),
            ));
        }

        if self.open_retry_attempts == 0 {
            return Err(LvhdError::ConfigError(
                "open_retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.max_mapper_name_len < MIN_MAPPER_NAME_LEN {
            return Err(LvhdError::ConfigError(format!(
                "max_mapper_name_len must be at least {} (found {})",
                MIN_MAPPER_NAME_LEN, self.max_mapper_name_len
            )));
        }

        Ok(())
    }
}
