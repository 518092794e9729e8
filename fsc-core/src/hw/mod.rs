//! Hardware interaction modules
//!
//! Sensor sources, fan channels and the machine that sweeps them. All
//! blocking I/O goes through [`SensorIo`].

mod control;
mod io;
mod machine;
mod sensor;

pub use control::{duty_to_register, read_fan_rpm, write_fan_duty, FanReadSpec, FanSpec, FanWriteSpec};
pub use io::{render_template, SensorIo, SystemIo};
pub use machine::{Fan, Machine};
pub use sensor::{
    parse_fan_dump, parse_sensor_dump, AlarmHit, AlarmLimit, FanDumpEntry, GuardTrip, InvalidLimit, ReadContext,
    ReadLimit, SensorSource, SensorSpec, SourceSpec, ValidLimit, DUMP_DEBUG_MARKER,
};
