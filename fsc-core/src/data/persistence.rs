//! On-disk records shared with other processes
//!
//! Small files under well-known directories: one mode record per zone and
//! marker files whose existence signals an ongoing failure. Mode records are
//! replaced atomically so readers never observe a partial write.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::constants::paths;
use crate::data::FanMode;
use crate::error::{FscError, Result};

/// Record directory layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDirs {
    #[serde(default = "default_record_dir")]
    pub record_dir: PathBuf,
    #[serde(default = "default_sensor_fail_dir")]
    pub sensor_fail_dir: PathBuf,
    #[serde(default = "default_fan_fail_dir")]
    pub fan_fail_dir: PathBuf,
}

fn default_record_dir() -> PathBuf {
    PathBuf::from(paths::RECORD_DIR)
}

fn default_sensor_fail_dir() -> PathBuf {
    PathBuf::from(paths::SENSOR_FAIL_RECORD_DIR)
}

fn default_fan_fail_dir() -> PathBuf {
    PathBuf::from(paths::FAN_FAIL_RECORD_DIR)
}

impl Default for RecordDirs {
    fn default() -> Self {
        Self {
            record_dir: default_record_dir(),
            sensor_fail_dir: default_sensor_fail_dir(),
            fan_fail_dir: default_fan_fail_dir(),
        }
    }
}

/// Narrow persistence interface for mode records and failure markers
#[derive(Debug, Clone)]
pub struct RecordStore {
    dirs: RecordDirs,
}

impl RecordStore {
    pub fn new(dirs: RecordDirs) -> Self {
        Self { dirs }
    }

    pub fn dirs(&self) -> &RecordDirs {
        &self.dirs
    }

    /// Create all record directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.dirs.record_dir, &self.dirs.sensor_fail_dir, &self.dirs.fan_fail_dir] {
            fs::create_dir_all(dir).map_err(|e| FscError::FileWrite { path: dir.clone(), source: e })?;
        }
        Ok(())
    }

    pub fn mode_path(&self, zone_index: usize) -> PathBuf {
        self.dirs.record_dir.join(format!("zone{}_mode", zone_index))
    }

    /// Atomically replace the zone's mode record
    pub fn write_mode(&self, zone_index: usize, mode: FanMode) -> Result<()> {
        let path = self.mode_path(zone_index);
        write_atomic(&path, mode.record_value().to_string().as_bytes())?;
        debug!(zone = zone_index, mode = %mode, "Wrote fan mode record");
        Ok(())
    }

    /// Read a zone's mode record back (other tools do the same)
    pub fn read_mode(&self, zone_index: usize) -> Option<FanMode> {
        let content = fs::read_to_string(self.mode_path(zone_index)).ok()?;
        match content.trim() {
            "0" => Some(FanMode::Normal),
            "1" => Some(FanMode::Transitional),
            "2" => Some(FanMode::Boost),
            "3" => Some(FanMode::Progressive),
            _ => None,
        }
    }

    pub fn sensor_fail_path(&self, variable: &str) -> PathBuf {
        self.dirs.sensor_fail_dir.join(marker_name(variable))
    }

    pub fn fan_fail_path(&self, label: &str) -> PathBuf {
        self.dirs.fan_fail_dir.join(marker_name(label))
    }

    pub fn shared_marker_path(&self, name: &str) -> PathBuf {
        self.dirs.record_dir.join(name)
    }

    /// Per-sensor failure marker, `board:sensor` variable name
    pub fn set_sensor_fail(&self, variable: &str, failing: bool) {
        set_marker(&self.sensor_fail_path(variable), failing);
    }

    /// Per-fan failure marker
    pub fn set_fan_fail(&self, label: &str, failing: bool) {
        set_marker(&self.fan_fail_path(label), failing);
    }

    /// Shared marker in the record directory (e.g. `sensor_fail_boost`)
    pub fn set_shared_marker(&self, name: &str, present: bool) {
        set_marker(&self.shared_marker_path(name), present);
    }
}

/// Write to a temp file in the same directory, then rename over the target
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FscError::FileWrite { path: parent.to_path_buf(), source: e })?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .map_err(|e| FscError::FileWrite { path: temp_path.clone(), source: e })?;
    file.write_all(contents)
        .map_err(|e| FscError::FileWrite { path: temp_path.clone(), source: e })?;
    file.sync_all()
        .map_err(|e| FscError::FileWrite { path: temp_path.clone(), source: e })?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| FscError::FileWrite { path: path.to_path_buf(), source: e })
}

/// Idempotent create/remove of an empty marker file; failures only warn
fn set_marker(path: &Path, present: bool) {
    let exists = path.exists();
    if present && !exists {
        if let Err(e) = fs::File::create(path) {
            warn!("Cannot create failure record {:?}: {}", path, e);
        }
    } else if !present && exists {
        if let Err(e) = fs::remove_file(path) {
            warn!("Cannot remove failure record {:?}: {}", path, e);
        }
    }
}

fn marker_name(name: &str) -> String {
    name.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> RecordStore {
        let root = dir.path();
        let store = RecordStore::new(RecordDirs {
            record_dir: root.join("cache_store"),
            sensor_fail_dir: root.join("sensorfail_record"),
            fan_fail_dir: root.join("fanfail_record"),
        });
        store.ensure_dirs().unwrap();
        store
    }

    #[test]
    fn test_mode_record_roundtrip_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.write_mode(0, FanMode::Boost).unwrap();
        assert_eq!(store.read_mode(0), Some(FanMode::Boost));
        assert_eq!(fs::read_to_string(store.mode_path(0)).unwrap(), "2");
        assert!(!store.mode_path(0).with_extension("tmp").exists());

        store.write_mode(0, FanMode::Normal).unwrap();
        assert_eq!(store.read_mode(0), Some(FanMode::Normal));
    }

    #[test]
    fn test_markers_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.set_sensor_fail("mb:cpu_temp", true);
        store.set_sensor_fail("mb:cpu_temp", true);
        assert!(store.sensor_fail_path("mb:cpu_temp").exists());

        store.set_sensor_fail("mb:cpu_temp", false);
        store.set_sensor_fail("mb:cpu_temp", false);
        assert!(!store.sensor_fail_path("mb:cpu_temp").exists());
    }

    #[test]
    fn test_marker_names_cannot_escape_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let path = store.fan_fail_path("Fan 1/rear");
        assert_eq!(path.parent().unwrap(), store.dirs().fan_fail_dir.as_path());
    }
}
