//! Scripted I/O for tests
//!
//! [`FakeIo`] stands in for sysfs files and helper processes. Writes are
//! recorded in order so tests can inspect the last duty sent to each output.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{FscError, Result};
use crate::hw::SensorIo;

#[derive(Debug, Default)]
struct FakeState {
    files: HashMap<PathBuf, String>,
    commands: HashMap<String, String>,
    failing_commands: HashSet<String>,
    writes: Vec<(PathBuf, String)>,
    commands_run: Vec<String>,
}

/// Cloneable handle; clones share the same scripted state
#[derive(Debug, Clone, Default)]
pub struct FakeIo {
    state: Arc<Mutex<FakeState>>,
}

impl FakeIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file(&self, path: impl AsRef<Path>, contents: &str) {
        self.state.lock().files.insert(path.as_ref().to_path_buf(), contents.to_string());
    }

    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.state.lock().files.remove(path.as_ref());
    }

    /// Script the stdout for an exact command line
    pub fn set_command(&self, command: &str, stdout: &str) {
        let mut state = self.state.lock();
        state.failing_commands.remove(command);
        state.commands.insert(command.to_string(), stdout.to_string());
    }

    pub fn fail_command(&self, command: &str) {
        self.state.lock().failing_commands.insert(command.to_string());
    }

    /// Every `write_file` call in order
    pub fn writes(&self) -> Vec<(PathBuf, String)> {
        self.state.lock().writes.clone()
    }

    /// Last value written to `path`
    pub fn last_write(&self, path: impl AsRef<Path>) -> Option<String> {
        let state = self.state.lock();
        state
            .writes
            .iter()
            .rev()
            .find(|(p, _)| p == path.as_ref())
            .map(|(_, v)| v.clone())
    }

    pub fn commands_run(&self) -> Vec<String> {
        self.state.lock().commands_run.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.writes.clear();
        state.commands_run.clear();
    }
}

impl SensorIo for FakeIo {
    fn read_file(&self, path: &Path) -> Result<String> {
        self.state.lock().files.get(path).cloned().ok_or_else(|| FscError::FileRead {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
        })
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.writes.push((path.to_path_buf(), contents.to_string()));
        state.files.insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn run_command(&self, command: &str) -> Result<String> {
        let mut state = self.state.lock();
        state.commands_run.push(command.to_string());
        if state.failing_commands.contains(command) {
            return Err(FscError::command(command, "scripted failure"));
        }
        state
            .commands
            .get(command)
            .cloned()
            .ok_or_else(|| FscError::command(command, "not scripted"))
    }
}
