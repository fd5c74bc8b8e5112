//! Pre- and post-build hook execution.
//!
//! Hooks are shell commands declared in the manifest, run in the module's
//! directory with stdout and stderr passed through. The first non-zero exit
//! aborts the build with the hook phase in the error.

use crate::error::{KilnError, Result};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Run a sequence of shell commands in `dir`, labeling failures with
/// `phase` ("pre-build" or "post-build").
pub fn run_commands(phase: &str, commands: &[String], dir: &Path) -> Result<()> {
    for command in commands {
        debug!(phase, command = %command, "running hook");
        let status = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .status()
            .map_err(|e| KilnError::Hook {
                phase: phase.to_string(),
                message: format!("failed to run '{}': {}", command, e),
            })?;
        if !status.success() {
            return Err(KilnError::Hook {
                phase: phase.to_string(),
                message: format!("'{}' exited with {}", command, status),
            });
        }
    }
    Ok(())
}
