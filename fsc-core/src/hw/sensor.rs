//! Sensor sources and helper-process dump parsing
//!
//! # Dump grammar
//!
//! The board sensor helper prints one line per sensor:
//!
//! ```text
//! MB_INLET_TEMP (0xA0) :   27.00 C     | (ok) | UCR: 40.000 | UNC: 35.000
//! MB_SSD0_TEMP  (0xA5) : NA | (na)
//! ```
//!
//! The NA shape is matched first; the numeric pattern would otherwise
//! partially match it. Lines mentioning `failed` or carrying the helper's
//! debug marker are skipped.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::data::{BoardSensors, SensorStatus, SensorValue};
use crate::hw::io::SensorIo;

/// Prefix the helper uses for its own diagnostic lines
pub const DUMP_DEBUG_MARKER: &str = "DEBUG:";

static NUMERIC_LINE: OnceLock<Option<Regex>> = OnceLock::new();
static NA_LINE: OnceLock<Option<Regex>> = OnceLock::new();
static FAN_LINE: OnceLock<Option<Regex>> = OnceLock::new();

fn numeric_line() -> Option<&'static Regex> {
    NUMERIC_LINE
        .get_or_init(|| Regex::new(r"^(.*)\((0x.*)\)\s+:\s+([\-+]?[0-9]*\.?[0-9]+)\s+(\S+)\s+\|\s+\(([^)]+)\)").ok())
        .as_ref()
}

fn na_line() -> Option<&'static Regex> {
    NA_LINE
        .get_or_init(|| Regex::new(r"^(.*)\((0x.*)\)\s+:\s+(NA)\s+\|\s+\(([^)]+)\)").ok())
        .as_ref()
}

fn fan_line() -> Option<&'static Regex> {
    FAN_LINE
        .get_or_init(|| Regex::new(r"^Fan\s+(.+?)\s+Speed:\s+(\d+)\s+RPM\s+\((\d+)%\)").ok())
        .as_ref()
}

fn parse_id(text: &str) -> Option<u32> {
    u32::from_str_radix(text.trim().trim_start_matches("0x").trim_start_matches("0X"), 16).ok()
}

/// Parse a full board sensor dump into name -> sample
pub fn parse_sensor_dump(text: &str) -> BoardSensors {
    let mut sensors = BoardSensors::new();
    let (Some(na_re), Some(numeric_re)) = (na_line(), numeric_line()) else {
        return sensors;
    };

    for line in text.lines() {
        if line.contains("failed") || line.contains(DUMP_DEBUG_MARKER) {
            continue;
        }

        if let Some(caps) = na_re.captures(line) {
            let name = caps[1].trim().to_string();
            let status = SensorStatus::parse(&caps[4]).unwrap_or(SensorStatus::Na);
            sensors.insert(
                name.clone(),
                SensorValue {
                    id: parse_id(&caps[2]),
                    value: None,
                    status: Some(status),
                    ..SensorValue::na(name)
                },
            );
        } else if let Some(caps) = numeric_re.captures(line) {
            let name = caps[1].trim().to_string();
            let value = caps[3].parse::<f64>().ok();
            sensors.insert(
                name.clone(),
                SensorValue {
                    id: parse_id(&caps[2]),
                    name,
                    value,
                    unit: Some(caps[4].to_string()),
                    status: SensorStatus::parse(&caps[5]),
                    read_fail_count: 0,
                    wrong_read_count: 0,
                },
            );
        }
    }

    sensors
}

/// One line of the fan speed dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanDumpEntry {
    pub label: String,
    pub rpm: u32,
    pub percent: u32,
}

/// Parse `Fan <label> Speed: <rpm> RPM (<pct>%)` lines in order
pub fn parse_fan_dump(text: &str) -> Vec<FanDumpEntry> {
    let Some(fan_re) = fan_line() else {
        return Vec::new();
    };
    text.lines()
        .filter_map(|line| {
            let caps = fan_re.captures(line.trim())?;
            Some(FanDumpEntry {
                label: caps[1].to_string(),
                rpm: caps[2].parse().ok()?,
                percent: caps[3].parse().ok()?,
            })
        })
        .collect()
}

// ============================================================================
// Source definitions
// ============================================================================

fn default_scale() -> f64 {
    1.0
}

/// Where a sensor's raw value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSpec {
    /// Memory-mapped style file holding a number
    Sysfs {
        path: PathBuf,
        /// Multiplier, e.g. 0.001 for millidegrees
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// Helper process whose stdout is a bare number or a sensor dump
    Util { command: String },
    /// File named `key` under the key-value cache directory
    Kv { key: String },
    /// Top-level key (or JSON pointer starting with `/`) of a JSON document
    Json { path: PathBuf, key: String },
    /// Entry of the board-wide sensor dump
    Dump,
}

/// One configured sensor: source plus optional offset correction and guards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub source: SourceSpec,
    #[serde(default)]
    pub unit: Option<String>,
    /// Flat correction added to every reading
    #[serde(default)]
    pub offset: Option<f64>,
    /// `(fan_duty_threshold, offset)` rows keyed on the last commanded duty
    #[serde(default)]
    pub offset_table: Option<Vec<(f64, f64)>>,
    #[serde(default)]
    pub read_limit: Option<ReadLimit>,
}

/// Consecutive-reading safe guards
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReadLimit {
    #[serde(default)]
    pub valid: Option<ValidLimit>,
    #[serde(default)]
    pub invalid: Option<InvalidLimit>,
    /// Checked first; a major alarm skips the minor check
    #[serde(default)]
    pub alarm_major: Option<AlarmLimit>,
    #[serde(default)]
    pub alarm_minor: Option<AlarmLimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidLimit {
    pub limit: f64,
    #[serde(default)]
    pub threshold: u32,
    pub action: String,
    /// Log instead of invoking the action
    #[serde(default)]
    pub fault_tolerant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidLimit {
    pub threshold: u32,
    pub action: String,
}

/// Temperature alarm that boosts every zone while raised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmLimit {
    pub limit: f64,
    #[serde(default)]
    pub action: Option<String>,
    /// A minor alarm stays raised this long after the last violation
    #[serde(default)]
    pub soak_time_s: Option<u64>,
    /// After the soak, a minor alarm stays raised above `limit - hysteresis`
    #[serde(default)]
    pub hysteresis: Option<f64>,
}

/// An alarm raised this tick
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmHit {
    pub action: Option<String>,
    pub cause: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlarmLevel {
    Major,
    Minor,
}

#[derive(Debug, Clone, Copy, Default)]
struct AlarmState {
    level: Option<AlarmLevel>,
    last_error: Option<Instant>,
    soak_repeats: u32,
}

/// A guard that fired this tick
#[derive(Debug, Clone, PartialEq)]
pub struct GuardTrip {
    pub action: String,
    pub cause: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct GuardState {
    over_limit: u32,
    failed: u32,
}

/// Per-call inputs shared by every source on a board
pub struct ReadContext<'a> {
    pub io: &'a dyn SensorIo,
    pub kv_dir: &'a Path,
    /// Parsed board dump, `None` when the dump command failed
    pub dump: Option<&'a BoardSensors>,
}

/// One configured sensor channel with its lifetime failure counters
#[derive(Debug, Clone)]
pub struct SensorSource {
    name: String,
    spec: SourceSpec,
    unit: Option<String>,
    read_limit: Option<ReadLimit>,
    read_fail_count: u32,
    wrong_read_count: u32,
    guard: GuardState,
    alarm: AlarmState,
}

enum RawRead {
    Value(f64, Option<SensorStatus>),
    Missing,
    Failed(String),
    Malformed(String),
}

impl SensorSource {
    pub fn new(name: impl Into<String>, spec: SourceSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            unit: None,
            read_limit: None,
            read_fail_count: 0,
            wrong_read_count: 0,
            guard: GuardState::default(),
            alarm: AlarmState::default(),
        }
    }

    pub fn with_unit(mut self, unit: Option<String>) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_read_limit(mut self, read_limit: Option<ReadLimit>) -> Self {
        self.read_limit = read_limit;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    pub fn read_fail_count(&self) -> u32 {
        self.read_fail_count
    }

    pub fn wrong_read_count(&self) -> u32 {
        self.wrong_read_count
    }

    /// Read one sample; `None` means the sensor is not present at all this tick
    pub fn read(&mut self, ctx: &ReadContext<'_>) -> Option<SensorValue> {
        let (value, status) = match self.read_raw(ctx) {
            RawRead::Value(v, status) => (Some(v), status.or(Some(SensorStatus::Ok))),
            RawRead::Missing => return None,
            RawRead::Failed(reason) => {
                self.read_fail_count = self.read_fail_count.saturating_add(1);
                warn!("Sensor {} read failed ({} total): {}", self.name, self.read_fail_count, reason);
                (None, Some(SensorStatus::Na))
            }
            RawRead::Malformed(text) => {
                self.wrong_read_count = self.wrong_read_count.saturating_add(1);
                warn!(
                    "Sensor {} returned unparsable reading {:?} ({} total)",
                    self.name, text, self.wrong_read_count
                );
                (None, None)
            }
        };

        Some(SensorValue {
            id: None,
            name: self.name.clone(),
            value,
            unit: self.unit.clone(),
            status,
            read_fail_count: self.read_fail_count,
            wrong_read_count: self.wrong_read_count,
        })
    }

    fn read_raw(&self, ctx: &ReadContext<'_>) -> RawRead {
        match &self.spec {
            SourceSpec::Sysfs { path, scale } => match ctx.io.read_file(path) {
                Ok(text) => parse_number(&text).map_or(RawRead::Malformed(text), |v| RawRead::Value(v * scale, None)),
                Err(e) => RawRead::Failed(e.to_string()),
            },
            SourceSpec::Kv { key } => match ctx.io.read_file(&ctx.kv_dir.join(key)) {
                Ok(text) => parse_number(&text).map_or(RawRead::Malformed(text), |v| RawRead::Value(v, None)),
                Err(e) => RawRead::Failed(e.to_string()),
            },
            SourceSpec::Util { command } => match ctx.io.run_command(command) {
                Ok(text) => self.parse_util_output(text),
                Err(e) => RawRead::Failed(e.to_string()),
            },
            SourceSpec::Json { path, key } => match ctx.io.read_file(path) {
                Ok(text) => json_value(&text, key).map_or(RawRead::Malformed(text), |v| RawRead::Value(v, None)),
                Err(e) => RawRead::Failed(e.to_string()),
            },
            SourceSpec::Dump => match ctx.dump {
                None => RawRead::Failed("board sensor dump unavailable".to_string()),
                Some(dump) => match dump.get(&self.name) {
                    None => RawRead::Missing,
                    Some(entry) => match entry.value {
                        Some(v) => RawRead::Value(v, entry.status),
                        None => RawRead::Failed(format!("dump reports status {:?}", entry.status)),
                    },
                },
            },
        }
    }

    fn parse_util_output(&self, text: String) -> RawRead {
        if let Some(v) = parse_number(&text) {
            return RawRead::Value(v, None);
        }

        let dump = parse_sensor_dump(&text);
        let entry = dump.get(&self.name).or_else(|| {
            if dump.len() == 1 {
                dump.values().next()
            } else {
                None
            }
        });
        match entry {
            Some(SensorValue { value: Some(v), status, .. }) => RawRead::Value(*v, *status),
            Some(_) => RawRead::Failed("helper reports NA".to_string()),
            None => RawRead::Malformed(text),
        }
    }

    /// Update the consecutive-reading guards with this tick's sample
    pub fn check_guards(&mut self, sample: Option<&SensorValue>) -> Vec<GuardTrip> {
        let mut trips = Vec::new();
        let Some(limits) = self.read_limit.as_ref() else {
            return trips;
        };
        let value = sample.and_then(|s| s.value);

        if let Some(valid) = &limits.valid {
            match value {
                Some(v) if v > valid.limit => {
                    self.guard.over_limit += 1;
                    if self.guard.over_limit > valid.threshold {
                        let cause = format!("{}(v={}) limit(t={}) reached", self.name, v, valid.limit);
                        if valid.fault_tolerant {
                            debug!("{} without action since fault_tolerant is enabled", cause);
                        } else {
                            trips.push(GuardTrip { action: valid.action.clone(), cause });
                        }
                        self.guard.over_limit = 0;
                    }
                }
                _ => self.guard.over_limit = 0,
            }
        }

        if let Some(invalid) = &limits.invalid {
            if value.is_none() {
                self.guard.failed += 1;
                if self.guard.failed >= invalid.threshold {
                    trips.push(GuardTrip {
                        action: invalid.action.clone(),
                        cause: format!("{} failed to read {} times", self.name, self.guard.failed),
                    });
                }
            } else {
                self.guard.failed = 0;
            }
        }

        trips
    }
}

impl SensorSource {
    /// Check the alarm thresholds against an offset-corrected reading
    ///
    /// Unreadable samples are skipped and leave the alarm state untouched.
    pub fn check_alarms(&mut self, value: Option<f64>, now: Instant) -> Option<AlarmHit> {
        let limits = self.read_limit.as_ref()?;
        let v = value?;

        if let Some(major) = &limits.alarm_major {
            if v >= major.limit {
                self.alarm.level = Some(AlarmLevel::Major);
                self.alarm.last_error = Some(now);
                return Some(AlarmHit {
                    action: major.action.clone(),
                    cause: format!("{}(alarm_major v={}) limit(t={}) reached", self.name, v, major.limit),
                });
            }
        }

        let minor = limits.alarm_minor.as_ref()?;
        let hit = |cause: String| Some(AlarmHit { action: minor.action.clone(), cause });

        if v >= minor.limit {
            self.alarm.level.get_or_insert(AlarmLevel::Minor);
            self.alarm.last_error = Some(now);
            return hit(format!("{}(alarm_minor v={}) limit(t={}) reached", self.name, v, minor.limit));
        }

        if let (Some(soak), Some(_)) = (minor.soak_time_s, self.alarm.level) {
            let soak = Duration::from_secs(soak);
            let elapsed = self.alarm.last_error.map_or(soak, |t| now.saturating_duration_since(t));
            if elapsed < soak {
                return hit(format!(
                    "{}(alarm_minor elapsed_time = {}, soak_time = {}) reached",
                    self.name,
                    elapsed.as_secs(),
                    soak.as_secs()
                ));
            }
            if let Some(hysteresis) = minor.hysteresis {
                let target = minor.limit - hysteresis.abs();
                if v > target {
                    self.alarm.soak_repeats += 1;
                    self.alarm.last_error = Some(now);
                    return hit(format!(
                        "{}(alarm_minor current v={}) target(t={}) soak_count (n={}) repeating",
                        self.name, v, target, self.alarm.soak_repeats
                    ));
                }
            }
        }

        self.alarm = AlarmState::default();
        None
    }
}

fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn json_value(text: &str, key: &str) -> Option<f64> {
    let doc: serde_json::Value = serde_json::from_str(text).ok()?;
    let node = if key.starts_with('/') { doc.pointer(key) } else { doc.get(key) }?;
    let value = match node {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => parse_number(s),
        _ => None,
    };
    value.filter(|v| v.is_finite())
}
