//! fscd core library
//!
//! Closed-loop fan speed control for a BMC: controllers evaluated over
//! sensor readings, grouped into zones that each command a set of fans.
//!
//! # Module Structure
//!
//! - `engine/` - Controllers, zone expressions, failure bucket tables
//! - `hw/` - Sensor sources, fan channels, the machine that sweeps them
//! - `data/` - Per-tick samples and the on-disk records shared with other tools
//! - `zone` - The per-zone pipeline (validity, escalation, ramp)
//! - `board` - Platform callouts
//! - `config` - The JSON configuration
//!
//! # Example
//!
//! ```no_run
//! use fsc_core::{FscConfig, ZoneSettings, Zone};
//!
//! let config = FscConfig::load(std::path::Path::new("/etc/fsc-config.json")).unwrap();
//! let settings = ZoneSettings::from_config(&config, false).unwrap();
//! let zones: Vec<Zone> = config
//!     .zones
//!     .iter()
//!     .enumerate()
//!     .map(|(i, spec)| Zone::new(i, spec, &config.profiles, settings.clone()).unwrap())
//!     .collect();
//! ```

// Grouped modules
pub mod data;
pub mod engine;
pub mod hw;

// Standalone modules
pub mod board;
pub mod config;
pub mod constants;
pub mod zone;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod error {
    pub use fsc_error::{FscError, Result};
}

pub use error::{FscError, Result};

pub use board::{BoardCallouts, CalloutCommands, CommandCallouts, NoopCallouts, Validity};
#[cfg(any(test, feature = "test-utils"))]
pub use board::MockBoardCallouts;

pub use config::{
    BoostConfig, FailSensorType, FanDeadBoostConfig, FscConfig, SsdProgressiveConfig, StandbyFanFailConfig,
    ValidCheckRule, ZoneSpec,
};

pub use data::{
    write_atomic, BoardSensors, FanMode, FanReading, RecordDirs, RecordStore, SensorMap, SensorStatus,
    SensorValue,
};

pub use engine::{
    compile, Bindings, BucketTable, CompiledExpr, Controller, DeadFanOverlay, ExprNode, Expression,
    FanDeadPolicy, MultiFanFail, ProfileSpec, TickContext,
};

pub use hw::{AlarmHit, FanSpec, GuardTrip, Machine, SensorIo, SensorSpec, SourceSpec, SystemIo};

pub use zone::{ramp, Zone, ZoneOutput, ZoneSettings};
