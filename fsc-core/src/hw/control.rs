//! Fan tachometer reads and duty-cycle writes
//!
//! # Duty values
//!
//! Duty is carried as a percentage (0-100) everywhere in the daemon. Register
//! style outputs scale it to their full-scale value on the way out, e.g. a
//! `max_duty_register` of 255 turns 50% into 128.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::constants::duty;
use crate::error::{FscError, Result};
use crate::hw::io::{render_template, SensorIo};

/// Where a fan's RPM is read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FanReadSpec {
    Sysfs { path: PathBuf },
    /// Line of the machine-wide fan speed dump
    Dump,
}

fn default_max_duty_register() -> f64 {
    duty::DEFAULT_MAX_DUTY_REGISTER
}

/// Where a fan's duty is written to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FanWriteSpec {
    Sysfs {
        path: PathBuf,
        #[serde(default = "default_max_duty_register")]
        max_duty_register: f64,
    },
    /// Command template with `{fan}` and `{duty}` placeholders
    Util { command: String },
}

/// One configured fan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSpec {
    /// Display name, `Fan <id>` when unset
    #[serde(default)]
    pub label: Option<String>,
    pub read: FanReadSpec,
    pub write: FanWriteSpec,
    /// Label to look up in the fan dump instead of positional matching
    #[serde(default)]
    pub dump_label: Option<String>,
}

/// Scale a percentage to a register value
pub fn duty_to_register(percent: f64, max_register: f64) -> u32 {
    let clamped = percent.clamp(duty::MIN, duty::MAX);
    (clamped / duty::MAX * max_register).round().max(0.0) as u32
}

/// Read a fan's RPM from its sysfs-style file
pub fn read_fan_rpm(io: &dyn SensorIo, fan_id: &str, spec: &FanReadSpec) -> Result<u32> {
    match spec {
        FanReadSpec::Sysfs { path } => {
            let content = io.read_file(path).map_err(|e| FscError::FanRead {
                fan: fan_id.to_string(),
                reason: e.to_string(),
            })?;
            content.trim().parse::<u32>().map_err(|e| FscError::FanRead {
                fan: fan_id.to_string(),
                reason: format!("Failed to parse '{}': {}", content.trim(), e),
            })
        }
        FanReadSpec::Dump => Err(FscError::FanRead {
            fan: fan_id.to_string(),
            reason: "dump-sourced fans are read through the fan dump".to_string(),
        }),
    }
}

/// Command one fan to a duty percentage
pub fn write_fan_duty(io: &dyn SensorIo, fan_id: &str, spec: &FanWriteSpec, percent: f64) -> Result<()> {
    let result = match spec {
        FanWriteSpec::Sysfs { path, max_duty_register } => {
            let value = duty_to_register(percent, *max_duty_register);
            io.write_file(path, &value.to_string())
        }
        FanWriteSpec::Util { command } => {
            let duty = format!("{}", percent.clamp(duty::MIN, duty::MAX).round() as u32);
            let command = render_template(command, &[("fan", fan_id), ("duty", &duty)]);
            io.run_command(&command).map(|_| ())
        }
    };

    result.map_err(|e| FscError::PwmWrite {
        fan: fan_id.to_string(),
        reason: e.to_string(),
    })
}
