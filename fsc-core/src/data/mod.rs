//! Data types and on-disk records
//!
//! Per-tick samples and the small files shared with other processes.

mod persistence;
mod types;

pub use persistence::{write_atomic, RecordDirs, RecordStore};
pub use types::{BoardSensors, FanMode, FanReading, SensorMap, SensorStatus, SensorValue};
