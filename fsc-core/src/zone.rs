//! Per-zone control pipeline
//!
//! A zone binds its expression variables from the tick's sensor map, applies
//! validity debounce and sensor-failure escalation, evaluates its expression
//! and turns the result into one ramp-limited duty cycle for its fan outputs.
//!
//! # Floors
//!
//! Escalations never lower the output. A sensor at `ucr` raises the tick's
//! floor to the transitional duty, a failed sensor (or too many failed SSDs)
//! raises it to boost, and the computed value is then `max(value, floor)`.
//!
//! # M.2 devices
//!
//! With `fail_sensor_type` configured, the zone counts how many M.2 device
//! sensors it could bind. Failed devices only go through the SSD offset table
//! while every expected device is present and nothing else is boosting; the
//! zone then reports [`FanMode::Progressive`].

use regex::{Regex, RegexBuilder};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::board::{BoardCallouts, Validity};
use crate::config::{FailSensorType, FscConfig, ZoneSpec};
use crate::constants::{duty, zone as limits};
use crate::data::{FanMode, RecordStore, SensorMap, SensorStatus};
use crate::engine::{compile, Bindings, BucketTable, Expression, ProfileSpec, TickContext};
use crate::error::{FscError, Result};

// ============================================================================
// Settings shared by all zones
// ============================================================================

#[derive(Debug, Clone)]
struct ValidRule {
    name: String,
    pattern: Regex,
    attribute: String,
}

/// Zone-independent knobs taken from the configuration
#[derive(Debug, Clone)]
pub struct ZoneSettings {
    pub transitional: f64,
    pub boost: f64,
    pub ramp_rate: f64,
    /// Escalate on sensors reporting `na`
    pub sensor_fail: bool,
    /// Failed non-SSD sensors are logged and marked but never boost
    pub sensor_fail_ignore: bool,
    /// Log the full evaluation trace at info
    pub verbose: bool,
    valid_rules: Vec<ValidRule>,
    ssd_patterns: Vec<Regex>,
    ssd_offsets: Option<BucketTable>,
    fail_types: Option<FailSensorType>,
}

impl ZoneSettings {
    pub fn from_config(config: &FscConfig, verbose: bool) -> Result<Self> {
        let valid_rules = config
            .sensor_valid_check
            .iter()
            .map(|(rule, check)| {
                // Rules anchor at the start of the sensor name
                let pattern = build_regex(&format!("^(?:{})", rule), "sensor_valid_check")?;
                Ok(ValidRule {
                    name: rule.clone(),
                    pattern,
                    attribute: check.attribute.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let ssd_patterns = config
            .ssd_patterns
            .iter()
            .map(|p| build_regex(p, "ssd_patterns"))
            .collect::<Result<Vec<_>>>()?;

        let ssd_offsets = config.ssd_progressive_algorithm.as_ref().map(|s| s.offset_algorithm.clone());

        Ok(Self {
            transitional: config.pwm_transition_value,
            boost: config.pwm_boost_value,
            ramp_rate: config.ramp_rate,
            sensor_fail: config.boost.sensor_fail || ssd_offsets.is_some(),
            sensor_fail_ignore: config.sensor_fail_ignore,
            verbose,
            valid_rules,
            ssd_patterns,
            ssd_offsets,
            fail_types: config.fail_sensor_type.clone(),
        })
    }

    fn valid_rule(&self, sensor: &str) -> Option<&ValidRule> {
        self.valid_rules.iter().find(|rule| rule.pattern.is_match(sensor))
    }

    /// SSD handling applies only with an offset table or failure types configured
    fn is_ssd(&self, reported_name: &str, sensor: &str) -> bool {
        (self.ssd_offsets.is_some() || self.fail_types.is_some())
            && self
                .ssd_patterns
                .iter()
                .any(|p| p.is_match(reported_name) || p.is_match(sensor))
    }
}

fn build_regex(pattern: &str, field: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| FscError::invalid_config(field, format!("bad pattern '{}': {}", pattern, e)))
}

/// Move at most `rate` from `last` toward `target`
pub fn ramp(last: f64, target: f64, rate: f64) -> f64 {
    if (target - last).abs() > rate {
        if target < last {
            last - rate
        } else {
            last + rate
        }
    } else {
        target
    }
}

// ============================================================================
// Zone
// ============================================================================

#[derive(Debug)]
struct WatchedVar {
    /// `board:sensor`
    name: String,
    board: String,
    sensor: String,
    missing_retry: u8,
    missing_asserted: bool,
    valid_cur: Validity,
    valid_pre: Validity,
}

impl WatchedVar {
    fn new(name: &str) -> Result<Self> {
        let (board, sensor) = name
            .split_once(':')
            .ok_or_else(|| FscError::invalid_config("zones", format!("variable '{}' is not board:sensor", name)))?;
        Ok(Self {
            name: name.to_string(),
            board: board.to_string(),
            sensor: sensor.to_string(),
            missing_retry: 0,
            missing_asserted: false,
            // A checked sensor needs two valid answers before it is trusted
            valid_cur: Validity::Invalid,
            valid_pre: Validity::Invalid,
        })
    }
}

/// Escalations accumulated while binding variables
#[derive(Debug, Default)]
struct Escalation {
    floor: f64,
    mode: FanMode,
    failed_ssds: u32,
    boost_causes: u32,
    /// M.2 device sensors bound this tick
    m2_present: u32,
    /// Keep the progressive mode instead of reporting normal
    progressive: bool,
}

impl Escalation {
    fn raise(&mut self, floor: f64, mode: FanMode) {
        self.floor = self.floor.max(floor);
        if self.floor == floor {
            self.mode = mode;
        }
    }
}

/// Result of one zone tick, before the driver's dead-fan overlay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneOutput {
    pub pwm: f64,
    pub mode: FanMode,
    /// A failed sensor pushed this zone to boost
    pub sensor_fail_boost: bool,
}

#[derive(Debug)]
pub struct Zone {
    index: usize,
    name: String,
    pwm_output: Vec<String>,
    expr: Box<dyn Expression>,
    vars: Vec<WatchedVar>,
    settings: ZoneSettings,
    last_pwm: f64,
    no_sane_asserted: bool,
    ssd_exhausted: bool,
    recorded_mode: Option<FanMode>,
}

impl Zone {
    /// Compile the zone's expression with fresh controller instances
    pub fn new(
        index: usize,
        spec: &ZoneSpec,
        profiles: &BTreeMap<String, ProfileSpec>,
        settings: ZoneSettings,
    ) -> Result<Self> {
        let expr = compile(&spec.expr, profiles)?;
        Self::with_expression(index, spec, Box::new(expr), settings)
    }

    pub fn with_expression(
        index: usize,
        spec: &ZoneSpec,
        expr: Box<dyn Expression>,
        settings: ZoneSettings,
    ) -> Result<Self> {
        if spec.pwm_output.is_empty() {
            return Err(FscError::invalid_config(format!("zones[{}]", index), "no pwm_output"));
        }
        let vars = expr.ext_vars().iter().map(|v| WatchedVar::new(v)).collect::<Result<Vec<_>>>()?;
        let name = spec.name.clone().unwrap_or_else(|| format!("zone{}", index));
        info!("Zone{} ({}) drives {:?} from {} variables", index, name, spec.pwm_output, vars.len());

        Ok(Self {
            index,
            name,
            pwm_output: spec.pwm_output.clone(),
            expr,
            vars,
            last_pwm: settings.transitional,
            settings,
            no_sane_asserted: false,
            ssd_exhausted: false,
            recorded_mode: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pwm_output(&self) -> &[String] {
        &self.pwm_output
    }

    /// Duty this zone commanded last
    pub fn last_pwm(&self) -> f64 {
        self.last_pwm
    }

    pub fn ext_vars(&self) -> &[String] {
        self.expr.ext_vars()
    }

    /// Run one tick of the pipeline
    pub fn run(
        &mut self,
        sensors: &SensorMap,
        dt: f64,
        dead_fan_count: u32,
        callouts: &dyn BoardCallouts,
        records: &RecordStore,
    ) -> ZoneOutput {
        let mut esc = Escalation::default();
        let mut bindings = Bindings::with_capacity(self.vars.len());
        for var in &mut self.vars {
            let value = bind_var(self.index, var, &self.settings, sensors, callouts, records, &mut esc);
            bindings.insert(var.name.clone(), value);
        }

        let ctx = TickContext {
            dt,
            dead_fan_count,
            last_pwm: self.last_pwm,
        };
        let computed = if self.settings.verbose {
            let (value, trace) = self.expr.debug_eval(&bindings, &ctx);
            info!("Zone{}: {}", self.index, trace);
            value
        } else {
            let value = self.expr.eval(&bindings, &ctx);
            debug!(zone = self.index, value = ?value, "Zone expression evaluated");
            value
        };

        let mut value = computed;
        let mut no_sane = false;
        if value.is_none() && esc.floor == 0.0 {
            if !self.no_sane_asserted {
                error!(
                    "ASSERT: Zone{} No sane fan speed could be calculated! Using transitional speed.",
                    self.index
                );
                self.no_sane_asserted = true;
            }
            value = Some(self.settings.transitional);
            esc.mode = FanMode::Transitional;
            no_sane = true;
        } else if self.no_sane_asserted {
            error!(
                "DEASSERT: Zone{} No sane fan speed could be calculated! Using transitional speed.",
                self.index
            );
            self.no_sane_asserted = false;
        }

        let failed_ssds = if self.m2_allows_offsets(&mut esc, callouts) { esc.failed_ssds } else { 0 };
        if failed_ssds > 0 {
            if let Some(offsets) = &self.settings.ssd_offsets {
                match offsets.lookup(failed_ssds) {
                    Some(offset) => {
                        info!("Zone{}: {} failed SSDs, offset {}", self.index, failed_ssds, offset);
                        value = Some(value.unwrap_or(0.0) + offset);
                        no_sane = false;
                        if self.ssd_exhausted {
                            warn!("DEASSERT: Zone{} failed SSD count back within offset table", self.index);
                            self.ssd_exhausted = false;
                        }
                    }
                    None => {
                        if !self.ssd_exhausted {
                            error!(
                                "ASSERT: Zone{} {} failed SSDs exceed the offset table, boosting",
                                self.index, failed_ssds
                            );
                            self.ssd_exhausted = true;
                        }
                        esc.raise(self.settings.boost, FanMode::Boost);
                        esc.mode = FanMode::Boost;
                        esc.boost_causes += 1;
                    }
                }
            }
        } else if self.ssd_exhausted {
            warn!("DEASSERT: Zone{} failed SSD count back within offset table", self.index);
            self.ssd_exhausted = false;
        }

        let mut value = value.unwrap_or(0.0);
        if value < esc.floor {
            value = esc.floor;
        } else if !no_sane && esc.floor == 0.0 && !esc.progressive {
            esc.mode = FanMode::Normal;
        }

        let target = value.clamp(duty::MIN, duty::MAX);
        let pwm = ramp(self.last_pwm, target, self.settings.ramp_rate);
        if pwm != target {
            debug!(zone = self.index, from = self.last_pwm, target, pwm, "Ramp limited");
        }
        self.last_pwm = pwm;

        ZoneOutput {
            pwm,
            mode: esc.mode,
            sensor_fail_boost: esc.boost_causes != 0,
        }
    }

    /// M.2 population check; returns whether failed SSDs use the offset table
    fn m2_allows_offsets(&self, esc: &mut Escalation, callouts: &dyn BoardCallouts) -> bool {
        let Some(types) = &self.settings.fail_types else {
            return true;
        };

        if types.m2_sensor_fail && types.m2_sensor_count > 0 {
            if esc.m2_present == 0 {
                if callouts.all_slots_power_off() {
                    debug!(zone = self.index, "All M.2 slots powered off");
                } else {
                    warn!("Zone{}: no M.2 device reported, boosting", self.index);
                    esc.raise(self.settings.boost, FanMode::Boost);
                    esc.mode = FanMode::Boost;
                    esc.boost_causes += 1;
                }
                return false;
            }
            if esc.m2_present != types.m2_sensor_count {
                warn!(
                    "Zone{}: {} of {} M.2 devices reported",
                    self.index, esc.m2_present, types.m2_sensor_count
                );
                esc.boost_causes += 1;
                return false;
            }
            if esc.boost_causes != 0 || esc.failed_ssds == 0 {
                return false;
            }
            esc.boost_causes += 1;
            esc.mode = FanMode::Progressive;
            esc.progressive = true;
        }

        types.ssd_sensor_fail
    }

    /// Forget asserted conditions so they are logged again
    pub fn rearm(&mut self) {
        self.no_sane_asserted = false;
        for var in &mut self.vars {
            var.missing_asserted = false;
        }
    }

    /// Mode last written to the zone's record
    pub fn recorded_mode(&self) -> Option<FanMode> {
        self.recorded_mode
    }

    /// Command the zone without running its pipeline (e.g. chassis intrusion)
    pub fn override_output(&mut self, pwm: f64) {
        self.last_pwm = pwm.clamp(duty::MIN, duty::MAX);
    }

    /// Persist the zone's mode; only changes are written
    pub fn record_mode(&mut self, mode: FanMode, records: &RecordStore) {
        if self.recorded_mode == Some(mode) {
            return;
        }
        match records.write_mode(self.index, mode) {
            Ok(()) => self.recorded_mode = Some(mode),
            Err(e) => warn!("Failed to record Zone{} mode: {}", self.index, e),
        }
    }
}

/// Bind one variable for this tick, updating its debounce state
fn bind_var(
    zone: usize,
    var: &mut WatchedVar,
    settings: &ZoneSettings,
    sensors: &SensorMap,
    callouts: &dyn BoardCallouts,
    records: &RecordStore,
    esc: &mut Escalation,
) -> Option<f64> {
    let mut trusted = true;
    if let Some(rule) = settings.valid_rule(&var.sensor) {
        var.valid_cur = callouts.sensor_valid_check(&var.board, &var.sensor, &rule.name, &rule.attribute);
        if var.valid_cur == Validity::Invalid || var.valid_pre == Validity::Invalid {
            trusted = false;
            var.missing_retry = 0;
        }
    }

    let sample = sensors.get(&var.board).and_then(|board| board.get(&var.sensor));
    let bound = match sample {
        _ if !trusted => {
            if sample.is_some() && settings.sensor_fail {
                records.set_sensor_fail(&var.name, false);
            }
            None
        }
        Some(sample) => {
            var.missing_retry = 0;
            if var.missing_asserted {
                error!("DEASSERT: Zone{} Missing sensors: {}", zone, var.name);
                var.missing_asserted = false;
            }
            if var.sensor.contains(limits::M2_SENSOR_MARKER) {
                esc.m2_present += 1;
            }

            if sample.status == Some(SensorStatus::Ucr) {
                warn!("Sensor {} reporting status ucr", sample.name);
                esc.raise(settings.transitional, FanMode::Transitional);
            } else if settings.sensor_fail {
                let failed = sample.status == Some(SensorStatus::Na) && var.valid_cur != Validity::NotApplicable;
                if failed {
                    if settings.is_ssd(&sample.name, &var.sensor) {
                        warn!("M.2 device {} failed", var.name);
                        esc.failed_ssds += 1;
                    } else if settings.sensor_fail_ignore {
                        warn!("{} failed, ignored", var.name);
                    } else {
                        warn!("{} failed", var.name);
                        esc.raise(settings.boost, FanMode::Boost);
                        esc.boost_causes += 1;
                    }
                }
                records.set_sensor_fail(&var.name, failed);
            }
            sample.value
        }
        None => {
            if !var.missing_asserted && var.missing_retry >= limits::MISSING_SENSOR_RETRIES {
                error!("ASSERT: Zone{} Missing sensors: {}", zone, var.name);
                var.missing_asserted = true;
            }
            if var.missing_retry < limits::MISSING_SENSOR_RETRIES {
                var.missing_retry += 1;
            }
            None
        }
    };

    var.valid_pre = var.valid_cur;
    bound
}
