//! External command runner for the volume manager.
//!
//! Provides a wrapper around LVM/device-mapper commands with captured
//! stdout/stderr and structured error handling. All volume manager commands
//! go through this module.

use crate::error::{LvhdError, Result};
use std::process::{Command, Output};
use tracing::debug;

/// Result of a successful command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output from the command (trimmed).
    pub stdout: String,
    /// Standard error from the command (trimmed).
    pub stderr: String,
}

impl CommandOutput {
    fn from_output(output: &Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Returns stdout lines as a vector.
    pub fn lines(&self) -> Vec<&str> {
        if self.stdout.is_empty() {
            Vec::new()
        } else {
            self.stdout.lines().collect()
        }
    }
}

/// Render a command line for logs and error messages.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut words = Vec::with_capacity(args.len() + 1);
    words.push(program);
    words.extend_from_slice(args);
    shell_words::join(words)
}

/// Run `program` with `args`.
///
/// # Returns
///
/// * `Ok(CommandOutput)` - On successful execution (exit code 0)
/// * `Err(LvhdError::CommandFailed)` - On spawn failure (code -1) or non-zero exit
pub fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let line = command_line(program, args);
    debug!("Running command: {}", line);

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| LvhdError::CommandFailed {
            command: line.clone(),
            code: -1,
            stderr: format!("failed to execute: {}", e),
        })?;

    let command_output = CommandOutput::from_output(&output);

    if output.status.success() {
        Ok(command_output)
    } else {
        let stderr = if command_output.stderr.is_empty() {
            command_output.stdout.clone()
        } else {
            command_output.stderr.clone()
        };
        Err(LvhdError::CommandFailed {
            command: line,
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}
