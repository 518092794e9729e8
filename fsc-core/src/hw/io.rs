//! Blocking I/O seam for sensors, fans and callouts
//!
//! Everything that touches sysfs-style files or spawns helper processes goes
//! through [`SensorIo`] so tests can script the hardware.

use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::trace;

use crate::error::{FscError, Result};

pub trait SensorIo: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<String>;

    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Run a shell command line and return its stdout on success
    fn run_command(&self, command: &str) -> Result<String>;
}

/// Production I/O: real files and `sh -c`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIo;

impl SensorIo for SystemIo {
    fn read_file(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| FscError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents).map_err(|e| FscError::FileWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn run_command(&self, command: &str) -> Result<String> {
        trace!("Running helper: {}", command);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| FscError::command(command, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FscError::command(
                command,
                format!("exit status {}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Substitute `{name}` placeholders in a command template
///
/// Values are shell-quoted, so a cause string such as
/// `inlet(v=60) limit(t=50) reached` reaches the helper as one argument.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), &shell_quote(value))
    })
}

/// Single-quote `value` unless it is made only of shell-inert characters
fn shell_quote(value: &str) -> String {
    let inert = |c: char| c.is_ascii_alphanumeric() || "_-.,:/@%+=".contains(c);
    if !value.is_empty() && value.chars().all(inert) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
