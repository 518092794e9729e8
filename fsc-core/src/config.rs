//! Daemon configuration
//!
//! A single JSON document. Every optional key falls back to a value from
//! [`crate::constants`]; [`FscConfig::validate`] rejects anything that would
//! leave the loop running with a half-built zone.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::board::CalloutCommands;
use crate::constants::{duty, fan, paths, timing, zone};
use crate::data::RecordDirs;
use crate::engine::{BucketTable, ExprNode, FanDeadPolicy, MultiFanFail, ProfileSpec};
use crate::error::{FscError, Result};
use crate::hw::{FanSpec, SensorSpec};

fn default_min_rpm() -> u32 {
    fan::DEFAULT_MIN_RPM
}

fn default_ramp_rate() -> f64 {
    duty::DEFAULT_RAMP_RATE
}

fn default_transitional() -> f64 {
    duty::DEFAULT_TRANSITIONAL
}

fn default_boost() -> f64 {
    duty::DEFAULT_BOOST
}

fn default_true() -> bool {
    true
}

fn default_watchdog_device() -> PathBuf {
    PathBuf::from(paths::WATCHDOG_DEVICE)
}

fn default_watchdog_timeout() -> u64 {
    timing::DEFAULT_WATCHDOG_TIMEOUT_S
}

fn default_fanpower_warmup() -> u64 {
    timing::DEFAULT_FANPOWER_WARMUP_S
}

fn default_ssd_patterns() -> Vec<String> {
    zone::DEFAULT_SSD_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_kv_dir() -> PathBuf {
    PathBuf::from(paths::KV_DIR)
}

fn default_fan_dead_table() -> BucketTable {
    BucketTable::new(duty::DEFAULT_FAN_DEAD_BOOST.to_vec())
}

/// Which failure classes escalate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostConfig {
    #[serde(default = "default_true")]
    pub fan_fail: bool,
    #[serde(default)]
    pub sensor_fail: bool,
    /// Progressive dead-fan overlay instead of immediate boost
    #[serde(default)]
    pub progressive: bool,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            fan_fail: true,
            sensor_fail: false,
            progressive: false,
        }
    }
}

/// Progressive dead-fan overlay table and the all-fans-dead escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanDeadBoostConfig {
    #[serde(default = "default_fan_dead_table")]
    pub data: BucketTable,
    /// Ticks with every fan dead before `action` runs
    #[serde(default)]
    pub threshold: Option<u32>,
    #[serde(default)]
    pub action: Option<String>,
}

impl Default for FanDeadBoostConfig {
    fn default() -> Self {
        Self {
            data: default_fan_dead_table(),
            threshold: None,
            action: None,
        }
    }
}

/// Validity rule applied to sensors whose name matches the rule key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidCheckRule {
    pub attribute: String,
}

/// Failed-SSD offset table, `(max_failed_count, offset)` buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SsdProgressiveConfig {
    pub offset_algorithm: BucketTable,
}

/// Immediate-policy duty used while fan power is off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandbyFanFailConfig {
    pub fan_pwm: f64,
}

/// Which sensor classes get M.2/SSD failure handling
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FailSensorType {
    /// Count populated M.2 devices against `m2_sensor_count`
    #[serde(rename = "M2_sensor_fail", default)]
    pub m2_sensor_fail: bool,
    #[serde(rename = "M2_sensor_count", default)]
    pub m2_sensor_count: u32,
    /// Apply the SSD offset table to failed devices
    #[serde(rename = "SSD_sensor_fail", default)]
    pub ssd_sensor_fail: bool,
}

/// One cooling zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Fan ids commanded by this zone
    pub pwm_output: Vec<String>,
    pub expr: ExprNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FscConfig {
    pub sample_interval_ms: u64,

    #[serde(default = "default_min_rpm")]
    pub min_rpm: u32,

    #[serde(default = "default_ramp_rate")]
    pub ramp_rate: f64,

    #[serde(default = "default_transitional")]
    pub pwm_transition_value: f64,

    #[serde(default = "default_boost")]
    pub pwm_boost_value: f64,

    #[serde(default)]
    pub boost: BoostConfig,

    #[serde(default)]
    pub fan_dead_boost: FanDeadBoostConfig,

    #[serde(default)]
    pub output_max_boost_pwm: bool,

    /// Substituted for the boost value when a zone boosts for a sensor failure
    #[serde(default)]
    pub pwm_sensor_boost_value: Option<f64>,

    #[serde(default)]
    pub multi_fan_fail: Option<MultiFanFail>,

    #[serde(default)]
    pub standby_fan_fail: Option<StandbyFanFailConfig>,

    /// Output cap while no fan is dead
    #[serde(default)]
    pub non_fanfail_limited_boost_value: Option<f64>,

    #[serde(default)]
    pub fan_limit_upper_pwm: Option<f64>,

    #[serde(default)]
    pub fan_limit_lower_pwm: Option<f64>,

    #[serde(default)]
    pub watchdog: bool,

    #[serde(default = "default_watchdog_device")]
    pub watchdog_device: PathBuf,

    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_s: u64,

    /// FRU power sequencing gates the loop
    #[serde(default)]
    pub fanpower: bool,

    #[serde(default = "default_fanpower_warmup")]
    pub fanpower_warmup_s: u64,

    #[serde(default)]
    pub fan_recovery_time_s: Option<u64>,

    #[serde(default)]
    pub chassis_intrusion: bool,

    /// Boost every zone while a sensor alarm (`read_limit.alarm_*`) is raised
    #[serde(default)]
    pub enable_fsc_sensor_check: bool,

    /// Log failed sensors without boosting for them
    #[serde(default)]
    pub sensor_fail_ignore: bool,

    #[serde(default)]
    pub fail_sensor_type: Option<FailSensorType>,

    /// Sensor-name regex -> rule
    #[serde(default)]
    pub sensor_valid_check: BTreeMap<String, ValidCheckRule>,

    #[serde(default)]
    pub ssd_progressive_algorithm: Option<SsdProgressiveConfig>,

    #[serde(default = "default_ssd_patterns")]
    pub ssd_patterns: Vec<String>,

    /// `{board}` is substituted
    #[serde(default)]
    pub sensor_dump_command: Option<String>,

    #[serde(default)]
    pub fan_dump_command: Option<String>,

    #[serde(default = "default_kv_dir")]
    pub kv_dir: PathBuf,

    #[serde(default)]
    pub records: RecordDirs,

    #[serde(default)]
    pub callouts: CalloutCommands,

    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileSpec>,

    /// Board -> sensor name -> definition
    #[serde(default)]
    pub sensors: BTreeMap<String, BTreeMap<String, SensorSpec>>,

    pub fans: BTreeMap<String, FanSpec>,

    pub zones: Vec<ZoneSpec>,
}

impl FscConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| FscError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config = Self::from_json(&content)?;
        info!("Started, reading configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: FscConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn fan_dead_policy(&self) -> FanDeadPolicy {
        if self.boost.progressive {
            FanDeadPolicy::Progressive
        } else {
            FanDeadPolicy::Immediate
        }
    }

    /// Boards referenced by any zone expression
    pub fn referenced_boards(&self) -> BTreeSet<String> {
        let mut boards = BTreeSet::new();
        for zone in &self.zones {
            collect_boards(&zone.expr, &mut boards);
        }
        boards
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(FscError::invalid_config("sample_interval_ms", "must be greater than zero"));
        }

        let duties = [
            ("pwm_transition_value", Some(self.pwm_transition_value)),
            ("pwm_boost_value", Some(self.pwm_boost_value)),
            ("pwm_sensor_boost_value", self.pwm_sensor_boost_value),
            ("fan_limit_upper_pwm", self.fan_limit_upper_pwm),
            ("fan_limit_lower_pwm", self.fan_limit_lower_pwm),
            ("non_fanfail_limited_boost_value", self.non_fanfail_limited_boost_value),
            ("standby_fan_fail.fan_pwm", self.standby_fan_fail.as_ref().map(|s| s.fan_pwm)),
        ];
        for (field, value) in duties {
            if let Some(v) = value {
                if !(duty::MIN..=duty::MAX).contains(&v) {
                    return Err(FscError::invalid_config(field, format!("{} is outside 0-100", v)));
                }
            }
        }
        if let Some(multi) = &self.multi_fan_fail {
            if let Some((_, v)) = multi.data.iter().find(|(_, v)| !(duty::MIN..=duty::MAX).contains(v)) {
                return Err(FscError::invalid_config("multi_fan_fail.data", format!("{} is outside 0-100", v)));
            }
        }
        if let (Some(lower), Some(upper)) = (self.fan_limit_lower_pwm, self.fan_limit_upper_pwm) {
            if lower > upper {
                return Err(FscError::invalid_config("fan_limit_lower_pwm", "exceeds fan_limit_upper_pwm"));
            }
        }

        if !(self.ramp_rate.is_finite() && self.ramp_rate > 0.0) {
            return Err(FscError::invalid_config("ramp_rate", "must be a positive number"));
        }

        // Every wait is fed from the sample interval, so it bounds the gap between kicks
        let kick_gap_ms = self.sample_interval_ms.saturating_mul(2);
        if self.watchdog && kick_gap_ms >= self.watchdog_timeout_s.saturating_mul(1000) {
            return Err(FscError::invalid_config(
                "sample_interval_ms",
                format!(
                    "{} ms leaves no margin against a {} s watchdog timeout",
                    self.sample_interval_ms, self.watchdog_timeout_s
                ),
            ));
        }

        if self.zones.is_empty() {
            return Err(FscError::invalid_config("zones", "at least one zone is required"));
        }
        for (index, zone) in self.zones.iter().enumerate() {
            if zone.pwm_output.is_empty() {
                return Err(FscError::invalid_config(format!("zones[{}].pwm_output", index), "is empty"));
            }
            for fan_id in &zone.pwm_output {
                if !self.fans.contains_key(fan_id) {
                    return Err(FscError::UnknownReference {
                        kind: "fan",
                        name: fan_id.clone(),
                    });
                }
            }
        }

        for (board, sensors) in &self.sensors {
            for (name, spec) in sensors {
                if spec.offset.is_some() && spec.offset_table.is_some() {
                    return Err(FscError::invalid_config(
                        format!("sensors.{}.{}", board, name),
                        "offset and offset_table are mutually exclusive",
                    ));
                }
            }
        }

        for pattern in self.sensor_valid_check.keys().chain(self.ssd_patterns.iter()) {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| FscError::invalid_config("regex", format!("{}: {}", pattern, e)))?;
        }

        Ok(())
    }
}

fn collect_boards(node: &ExprNode, boards: &mut BTreeSet<String>) {
    match node {
        ExprNode::Max(children) | ExprNode::Min(children) | ExprNode::Sum(children) => {
            for child in children {
                collect_boards(child, boards);
            }
        }
        ExprNode::Apply { arg, .. } => collect_boards(arg, boards),
        ExprNode::Var(name) => {
            if let Some((board, _)) = name.split_once(':') {
                boards.insert(board.to_string());
            }
        }
        ExprNode::Const(_) => {}
    }
}
