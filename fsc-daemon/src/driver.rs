//! Sampling loop driver
//!
//! One [`Driver::tick`] per sample interval: power gating, the fan
//! tachometer sweep, the sensor sweep and alarm check, then every zone
//! followed by the dead-fan overlay and output limits.
//!
//! # Safety Features
//! - **Fail-safe output**: any panic inside a tick forces every fan to the
//!   boost duty before the process exits
//! - **Edge-triggered alerts**: dead fans are logged when they die and when
//!   they recover, not every tick
//! - **Graceful degradation**: sensor and PWM write errors are logged and the
//!   tick carries on

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use fsc_core::constants::paths::{FAN_FAIL_BOOST_MARKER, SENSOR_FAIL_BOOST_MARKER};
use fsc_core::{
    write_atomic, BoardCallouts, DeadFanOverlay, FanDeadPolicy, FanMode, FscConfig, Machine, RecordStore, SensorIo,
    SensorMap, Zone, ZoneSettings,
};
use fsc_error::{FscError, Result};

use crate::watchdog::Watchdog;

/// Key-value entry an operator sets to `1` to re-raise fan and sensor alerts
pub const FAN_DEAD_REARM_KEY: &str = "fan_dead_rearm";

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickStatus {
    Ran,
    /// Fan power is off; fan state left untouched
    PowerOff,
    /// Power just came back; this tick is skipped and the loop may wait `settle`
    PowerRestored { settle: Option<Duration> },
}

pub struct Driver {
    config: FscConfig,
    machine: Machine,
    zones: Vec<Zone>,
    callouts: Box<dyn BoardCallouts>,
    records: RecordStore,
    overlay: DeadFanOverlay,
    watchdog: Option<Watchdog>,
    sensor_fail: bool,
    dead_fans: BTreeSet<String>,
    all_dead_ticks: u32,
    power_off: bool,
    last_tick: Option<Instant>,
}

impl Driver {
    /// Build machine and zones; any configuration problem fails here
    pub fn new(
        config: FscConfig,
        io: Arc<dyn SensorIo>,
        callouts: Box<dyn BoardCallouts>,
        verbose: bool,
    ) -> Result<Self> {
        let settings = ZoneSettings::from_config(&config, verbose)?;
        let zones = config
            .zones
            .iter()
            .enumerate()
            .map(|(index, spec)| Zone::new(index, spec, &config.profiles, settings.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut machine = Machine::from_config(&config, io);
        for board in config.referenced_boards() {
            machine.register_board(board);
        }
        info!(
            "Read {} zones, {} fans, sensors from: {}",
            zones.len(),
            machine.fans().len(),
            machine.boards().iter().cloned().collect::<Vec<_>>().join(", ")
        );

        let overlay = DeadFanOverlay {
            policy: config.fan_dead_policy(),
            table: config.fan_dead_boost.data.clone(),
            boost: config.pwm_boost_value,
            output_max_boost: config.output_max_boost_pwm,
            multi_fan_fail: config.multi_fan_fail.clone(),
            standby_pwm: config.standby_fan_fail.as_ref().map(|s| s.fan_pwm),
        };

        Ok(Self {
            records: RecordStore::new(config.records.clone()),
            sensor_fail: settings.sensor_fail,
            config,
            machine,
            zones,
            callouts,
            overlay,
            watchdog: None,
            dead_fans: BTreeSet::new(),
            all_dead_ticks: 0,
            power_off: false,
            last_tick: None,
        })
    }

    pub fn with_watchdog(mut self, watchdog: Watchdog) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    pub fn config(&self) -> &FscConfig {
        &self.config
    }

    /// Record directories, fans to transitional, first watchdog kick
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.records.ensure_dirs()?;

        let transitional = self.config.pwm_transition_value;
        info!("ACTION: Setting all fans to transitional duty {}%", transitional);
        if let Err(e) = self.machine.set_all_pwm(transitional) {
            warn!("Initial fan command incomplete: {}", e);
        }
        for zone in &mut self.zones {
            zone.override_output(transitional);
            zone.record_mode(FanMode::Transitional, &self.records);
        }

        self.kick_watchdog();
        self.last_tick = Some(now);
        Ok(())
    }

    pub fn kick_watchdog(&mut self) {
        if let Some(watchdog) = &mut self.watchdog {
            if let Err(e) = watchdog.kick() {
                warn!("{}", e);
            }
        }
    }

    /// Run one tick, converting a panic into fail-safe output
    ///
    /// A [`FscError::Fatal`] means the tick panicked; fans are already at
    /// boost and the caller must exit.
    pub fn guarded_tick(&mut self, now: Instant) -> Result<TickStatus> {
        panic::catch_unwind(AssertUnwindSafe(|| self.tick(now))).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!("CRITICAL: Control loop failed: {}", message);
            self.fail_safe();
            FscError::Fatal(message)
        })
    }

    pub fn tick(&mut self, now: Instant) -> TickStatus {
        if self.config.fanpower {
            if !self.callouts.host_power_status() {
                if !self.power_off {
                    info!("Fan power is off, leaving fans untouched");
                }
                self.power_off = true;
                return TickStatus::PowerOff;
            }
            if self.power_off {
                self.power_off = false;
                info!("Fan power restored, skipping one tick");
                return TickStatus::PowerRestored {
                    settle: self.config.fan_recovery_time_s.map(Duration::from_secs),
                };
            }
        }

        let rearm = self.check_fan_rearm();
        if rearm {
            info!("Fan dead rearm requested");
            for zone in &mut self.zones {
                zone.rearm();
            }
        }
        let dead = if self.config.boost.fan_fail { self.update_dead_fans(rearm) } else { 0 };

        let dt = self
            .last_tick
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f64());
        self.last_tick = Some(now);
        debug!(dt, dead, "Tick");

        let sensors = self.machine.read_sensors();
        for trip in self.machine.take_guard_trips() {
            self.callouts.host_action(&trip.action, &trip.cause);
        }

        self.update_zones(&sensors, dt, dead, now);
        TickStatus::Ran
    }

    /// Consume a pending rearm request from the key-value store
    fn check_fan_rearm(&self) -> bool {
        let path = self.config.kv_dir.join(FAN_DEAD_REARM_KEY);
        match std::fs::read_to_string(&path) {
            Ok(value) if value.trim() == "1" => {
                if let Err(e) = write_atomic(&path, b"0") {
                    warn!("Failed to reset {}: {}", FAN_DEAD_REARM_KEY, e);
                }
                true
            }
            _ => false,
        }
    }

    fn fan_label(&self, fan_id: &str) -> String {
        self.machine
            .fan(fan_id)
            .map_or_else(|| format!("Fan {}", fan_id), |fan| fan.label.clone())
    }

    /// Sweep tachometers; returns the dead fan count
    ///
    /// With `rearm`, fans that are still dead are reported again.
    fn update_dead_fans(&mut self, rearm: bool) -> u32 {
        let readings = self.machine.read_fans();
        let mut dead = BTreeSet::new();

        for reading in &readings {
            let label = self.fan_label(&reading.fan_id);
            match reading.rpm {
                Some(rpm) => info!("{} speed: {} RPM", label, rpm),
                None => warn!("{} speed could not be read", label),
            }
            if reading.is_dead(self.config.min_rpm) {
                self.callouts.fan_dead(&reading.fan_id, &label);
                dead.insert(reading.fan_id.clone());
            }
        }

        let fanpower = self.config.fanpower;
        let newly_dead = dead.difference(&self.dead_fans).next().is_some();
        if newly_dead || (rearm && !dead.is_empty()) {
            fan_alert(fanpower, &format!("{} fans failed", dead.len()));
            for reading in readings.iter().filter(|r| dead.contains(&r.fan_id)) {
                let label = self.fan_label(&reading.fan_id);
                let rpm = reading.rpm.map_or_else(|| "unreadable".to_string(), |rpm| format!("{} RPM", rpm));
                fan_alert(fanpower, &format!("{} dead, {}", label, rpm));
                self.records.set_fan_fail(&label, true);
            }
        }

        let recovered: Vec<String> = self.dead_fans.difference(&dead).cloned().collect();
        for fan_id in recovered {
            let label = self.fan_label(&fan_id);
            fan_alert(fanpower, &format!("{} has recovered", label));
            self.callouts.fan_recovered(&fan_id, &label);
            self.records.set_fan_fail(&label, false);
        }

        self.dead_fans = dead;
        self.dead_fans.len() as u32
    }

    fn update_zones(&mut self, sensors: &SensorMap, dt: f64, dead: u32, now: Instant) {
        let boost = self.config.pwm_boost_value;
        let fan_fail = self.config.boost.fan_fail;
        let limited_boost = self.config.non_fanfail_limited_boost_value;
        let mut sensor_fail_boost = false;

        let sensor_violated = self.config.enable_fsc_sensor_check && self.check_sensor_alarms(sensors, now);
        let fan_power_on = if fan_fail && dead > 0 { self.check_multi_fan_fail(dead) } else { true };
        // With the output capped, dead fans leave the recorded mode to the overlay
        let ignore_mode = limited_boost.is_some() && dead > 0;

        for zone in &mut self.zones {
            let intrusion = self.config.chassis_intrusion && self.callouts.chassis_intrusion_tripped();
            let (mut pwm, mut mode) = if intrusion || sensor_violated {
                warn!(
                    "Zone{}: {}, boosting",
                    zone.index(),
                    if intrusion { "chassis intrusion" } else { "sensor alarm" }
                );
                zone.override_output(boost);
                (boost, FanMode::Boost)
            } else {
                let out = zone.run(sensors, dt, dead, self.callouts.as_ref(), &self.records);
                sensor_fail_boost |= out.sensor_fail_boost;
                let mode = if ignore_mode { zone.recorded_mode().unwrap_or(out.mode) } else { out.mode };
                let mut pwm = out.pwm;
                if let Some(value) = self.config.pwm_sensor_boost_value {
                    if mode == FanMode::Boost && pwm == boost {
                        pwm = value;
                    }
                }
                (pwm, mode)
            };

            if fan_fail && dead > 0 {
                let (boosted, forced) = self.overlay.apply(pwm, dead, fan_power_on);
                info!("Zone{}: {} failed fans, {} -> {}", zone.index(), dead, pwm, boosted);
                pwm = boosted;
                if let Some(forced) = forced {
                    mode = forced;
                }
            }

            if let Some(upper) = self.config.fan_limit_upper_pwm {
                pwm = pwm.min(upper);
            }
            if let Some(lower) = self.config.fan_limit_lower_pwm {
                pwm = pwm.max(lower);
            }
            if let (Some(cap), 0) = (limited_boost, dead) {
                pwm = pwm.min(cap);
            }

            debug!(zone = zone.index(), pwm, mode = %mode, "Zone output");
            for fan in zone.pwm_output() {
                if let Err(e) = self.machine.set_pwm(fan, pwm) {
                    warn!("{}", e);
                }
            }
            zone.record_mode(mode, &self.records);
        }

        if self.sensor_fail {
            self.records.set_shared_marker(SENSOR_FAIL_BOOST_MARKER, sensor_fail_boost);
        }
        if fan_fail {
            self.records.set_shared_marker(FAN_FAIL_BOOST_MARKER, dead > 0);
            self.check_all_fans_dead(dead);
        }
    }

    /// Run alarm actions; returns whether any alarm is raised
    fn check_sensor_alarms(&mut self, sensors: &SensorMap, now: Instant) -> bool {
        let hits = self.machine.check_alarms(sensors, now);
        for hit in &hits {
            warn!("{}", hit.cause);
            if let Some(action) = &hit.action {
                self.callouts.host_action(action, &hit.cause);
            }
        }
        !hits.is_empty()
    }

    /// Fan power state for the overlay, plus the bad-fan-count shutdown
    fn check_multi_fan_fail(&self, dead: u32) -> bool {
        if self.overlay.policy != FanDeadPolicy::Immediate {
            return true;
        }
        let threshold = match &self.overlay.multi_fan_fail {
            Some(multi) if dead > 1 => multi.shutdown_threshold().filter(|count| dead >= *count),
            _ => None,
        };
        if threshold.is_none() && self.overlay.standby_pwm.is_none() {
            return true;
        }

        let fan_power_on = self.callouts.host_power_status();
        if let (Some(count), true) = (threshold, fan_power_on) {
            let cause = format!("Bad fan count exceeded threshold: {}", count);
            self.callouts.host_action("host_shutdown", &cause);
        }
        fan_power_on
    }

    fn check_all_fans_dead(&mut self, dead: u32) {
        let fans = self.machine.fans().len();
        if fans == 0 || dead as usize != fans {
            self.all_dead_ticks = 0;
            return;
        }

        self.all_dead_ticks += 1;
        warn!("Currently all fans failed for {} cycles", self.all_dead_ticks);
        let policy = &self.config.fan_dead_boost;
        if let (Some(threshold), Some(action)) = (policy.threshold, &policy.action) {
            if self.all_dead_ticks >= threshold {
                let cause = format!("All fans are bad for more than {} cycles", threshold);
                self.callouts.host_action(action, &cause);
            }
        }
    }

    /// Every fan to boost; used on panics and shutdown
    pub fn fail_safe(&mut self) {
        let boost = self.config.pwm_boost_value;
        error!("CRITICAL: Forcing all fans to fail-safe duty {}%", boost);
        if let Err(e) = self.machine.set_all_pwm(boost) {
            error!("CRITICAL: Fail-safe fan command incomplete: {}", e);
        }
        for zone in &mut self.zones {
            zone.override_output(boost);
            zone.record_mode(FanMode::Boost, &self.records);
        }
    }

    /// Fail-safe output, then release the watchdog
    pub fn shutdown(&mut self, disarm_watchdog: bool) {
        self.fail_safe();
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.release(disarm_watchdog);
        }
    }
}

fn fan_alert(fanpower: bool, message: &str) {
    // Dead reads are expected during power sequencing
    if fanpower {
        warn!("{}", message);
    } else {
        error!("CRITICAL: {}", message);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsc_core::test_utils::FakeIo;
    use fsc_core::{MockBoardCallouts, NoopCallouts, Validity};
    use mockall::predicate::{always, eq};
    use serde_json::json;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const DUMP_COMMAND: &str = "sensor-util mb";

    fn config_value(dir: &TempDir) -> serde_json::Value {
        json!({
            "sample_interval_ms": 1000,
            "ramp_rate": 100,
            "sensor_dump_command": "sensor-util {board}",
            "kv_dir": dir.path().join("kv"),
            "records": {
                "record_dir": dir.path().join("cache_store"),
                "sensor_fail_dir": dir.path().join("sensorfail_record"),
                "fan_fail_dir": dir.path().join("fanfail_record")
            },
            "profiles": {
                "linear_cpu": {"type": "linear", "data": [[80, 90], [60, 50], [0, 20]]}
            },
            "sensors": {"mb": {"cpu_temp": {"source": {"type": "dump"}}}},
            "fans": {
                "0": {"read": {"type": "sysfs", "path": "/sys/fan0_input"},
                      "write": {"type": "sysfs", "path": "/sys/pwm0"}},
                "1": {"read": {"type": "sysfs", "path": "/sys/fan1_input"},
                      "write": {"type": "sysfs", "path": "/sys/pwm1"}},
                "2": {"read": {"type": "sysfs", "path": "/sys/fan2_input"},
                      "write": {"type": "sysfs", "path": "/sys/pwm2"}}
            },
            "zones": [{
                "pwm_output": ["0", "1", "2"],
                "expr": {"apply": {"profile": "linear_cpu", "arg": {"var": "mb:cpu_temp"}}}
            }]
        })
    }

    struct Rig {
        io: FakeIo,
        driver: Driver,
        start: Instant,
        ticks: u64,
        dir: TempDir,
    }

    impl Rig {
        fn new(patch: impl FnOnce(&mut serde_json::Value), callouts: Box<dyn BoardCallouts>) -> Self {
            let dir = TempDir::new().unwrap();
            let mut value = config_value(&dir);
            patch(&mut value);
            let config = FscConfig::from_json(&value.to_string()).unwrap();

            let io = FakeIo::new();
            for fan in 0..3 {
                io.set_file(format!("/sys/fan{}_input", fan), "5000");
            }
            io.set_command(DUMP_COMMAND, "cpu_temp (0x1) : 65.00 C | (ok)");

            let mut driver = Driver::new(config, Arc::new(io.clone()), callouts, false).unwrap();
            let start = Instant::now();
            driver.start(start).unwrap();
            Rig { io, driver, start, ticks: 0, dir }
        }

        fn tick(&mut self) -> TickStatus {
            self.ticks += 1;
            self.driver.tick(self.start + Duration::from_secs(self.ticks))
        }

        fn pwm(&self, fan: u32) -> Option<String> {
            self.io.last_write(format!("/sys/pwm{}", fan))
        }

        fn records(&self) -> RecordStore {
            RecordStore::new(self.driver.config().records.clone())
        }
    }

    struct PanickingPower;

    impl BoardCallouts for PanickingPower {
        fn fan_dead(&self, _fan_id: &str, _label: &str) {}
        fn fan_recovered(&self, _fan_id: &str, _label: &str) {}
        fn sensor_valid_check(&self, _b: &str, _s: &str, _r: &str, _a: &str) -> Validity {
            Validity::Valid
        }
        fn chassis_intrusion_tripped(&self) -> bool {
            false
        }
        fn host_power_status(&self) -> bool {
            panic!("power helper crashed")
        }
        fn all_slots_power_off(&self) -> bool {
            false
        }
        fn host_action(&self, _action: &str, _cause: &str) -> bool {
            false
        }
    }

    #[test]
    fn test_startup_commands_transitional() {
        let rig = Rig::new(|_| {}, Box::new(NoopCallouts));
        for fan in 0..3 {
            assert_eq!(rig.pwm(fan).as_deref(), Some("70"));
        }
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Transitional));
        assert!(rig.dir.path().join("fanfail_record").is_dir());
    }

    #[test]
    fn test_tick_writes_zone_output_to_every_fan() {
        let mut rig = Rig::new(|_| {}, Box::new(NoopCallouts));
        assert_eq!(rig.tick(), TickStatus::Ran);
        for fan in 0..3 {
            assert_eq!(rig.pwm(fan).as_deref(), Some("50"));
        }
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Normal));
    }

    #[test]
    fn test_ramp_limited_from_last_command() {
        let mut rig = Rig::new(|c| c["ramp_rate"] = json!(10), Box::new(NoopCallouts));
        rig.io.set_command(DUMP_COMMAND, "cpu_temp (0x1) : 85.00 C | (ok)");
        rig.driver.zones[0].override_output(30.0);
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("40"));
    }

    #[test]
    fn test_panic_forces_fail_safe_on_every_fan() {
        let mut rig = Rig::new(|c| c["fanpower"] = json!(true), Box::new(PanickingPower));
        rig.io.clear_log();

        let result = rig.driver.guarded_tick(Instant::now());
        assert!(matches!(result, Err(ref e) if e.is_fatal()));
        for fan in 0..3 {
            assert_eq!(rig.pwm(fan).as_deref(), Some("100"));
        }
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));
    }

    #[test]
    fn test_progressive_overlay_adds_per_dead_fan() {
        let mut callouts = MockBoardCallouts::new();
        callouts.expect_fan_dead().with(eq("1"), eq("Fan 1")).times(2).return_const(());
        callouts.expect_fan_recovered().with(eq("1"), eq("Fan 1")).times(1).return_const(());

        let mut rig = Rig::new(|c| c["boost"]["progressive"] = json!(true), Box::new(callouts));
        rig.io.set_file("/sys/fan1_input", "0");

        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("60"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Normal));
        let records = rig.records();
        assert!(records.fan_fail_path("Fan 1").exists());
        assert!(records.shared_marker_path(FAN_FAIL_BOOST_MARKER).exists());

        rig.tick();
        assert_eq!(rig.pwm(2).as_deref(), Some("60"));

        rig.io.set_file("/sys/fan1_input", "5100");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("50"));
        assert!(!records.fan_fail_path("Fan 1").exists());
        assert!(!records.shared_marker_path(FAN_FAIL_BOOST_MARKER).exists());
    }

    #[test]
    fn test_progressive_overlay_boosts_beyond_table() {
        let mut rig = Rig::new(|c| c["boost"]["progressive"] = json!(true), Box::new(NoopCallouts));
        for fan in 0..3 {
            rig.io.set_file(format!("/sys/fan{}_input", fan), "0");
        }
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("100"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));
    }

    #[test]
    fn test_immediate_policy_boosts_on_one_dead_fan() {
        let mut rig = Rig::new(|_| {}, Box::new(NoopCallouts));
        rig.io.remove_file("/sys/fan2_input");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("100"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));
    }

    #[test]
    fn test_all_fans_dead_requests_host_action() {
        let mut callouts = MockBoardCallouts::new();
        callouts.expect_fan_dead().return_const(());
        callouts
            .expect_host_action()
            .with(eq("host_shutdown"), always())
            .times(2)
            .return_const(true);

        let mut rig = Rig::new(
            |c| c["fan_dead_boost"] = json!({"threshold": 2, "action": "host_shutdown"}),
            Box::new(callouts),
        );
        for fan in 0..3 {
            rig.io.set_file(format!("/sys/fan{}_input", fan), "100");
        }
        rig.tick();
        rig.tick();
        rig.tick();
        assert_eq!(rig.driver.all_dead_ticks, 3);
    }

    #[test]
    fn test_power_gating_skips_ticks() {
        let mut callouts = MockBoardCallouts::new();
        let mut seq = mockall::Sequence::new();
        callouts.expect_host_power_status().times(1).in_sequence(&mut seq).return_const(false);
        callouts.expect_host_power_status().times(2).in_sequence(&mut seq).return_const(true);

        let mut rig = Rig::new(
            |c| {
                c["fanpower"] = json!(true);
                c["fan_recovery_time_s"] = json!(5);
            },
            Box::new(callouts),
        );
        rig.io.clear_log();

        assert_eq!(rig.tick(), TickStatus::PowerOff);
        assert_eq!(
            rig.tick(),
            TickStatus::PowerRestored { settle: Some(Duration::from_secs(5)) }
        );
        assert!(rig.io.writes().is_empty());

        assert_eq!(rig.tick(), TickStatus::Ran);
        assert_eq!(rig.pwm(0).as_deref(), Some("50"));
    }

    #[test]
    fn test_chassis_intrusion_forces_boost() {
        let mut callouts = MockBoardCallouts::new();
        callouts.expect_chassis_intrusion_tripped().return_const(true);

        let mut rig = Rig::new(|c| c["chassis_intrusion"] = json!(true), Box::new(callouts));
        rig.tick();
        assert_eq!(rig.pwm(1).as_deref(), Some("100"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));
    }

    #[test]
    fn test_output_limits_and_sensor_boost_value() {
        let mut rig = Rig::new(
            |c| {
                c["fan_limit_lower_pwm"] = json!(55);
                c["fan_limit_upper_pwm"] = json!(85);
            },
            Box::new(NoopCallouts),
        );
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("55"));

        let mut rig = Rig::new(
            |c| {
                c["boost"]["sensor_fail"] = json!(true);
                c["pwm_sensor_boost_value"] = json!(80);
            },
            Box::new(NoopCallouts),
        );
        rig.io.set_command(DUMP_COMMAND, "cpu_temp (0x1) : NA | (na)");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("80"));
        assert!(rig.records().shared_marker_path(SENSOR_FAIL_BOOST_MARKER).exists());
    }

    #[test]
    fn test_standby_duty_with_fan_power_off() {
        let mut callouts = MockBoardCallouts::new();
        callouts.expect_fan_dead().return_const(());
        callouts.expect_host_power_status().return_const(false);

        let mut rig = Rig::new(|c| c["standby_fan_fail"] = json!({"fan_pwm": 40}), Box::new(callouts));
        rig.io.set_file("/sys/fan0_input", "0");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("40"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));
    }

    #[test]
    fn test_multi_fan_fail_duty_and_shutdown() {
        let mut callouts = MockBoardCallouts::new();
        callouts.expect_fan_dead().return_const(());
        callouts.expect_host_power_status().return_const(true);
        callouts
            .expect_host_action()
            .with(eq("host_shutdown"), eq("Bad fan count exceeded threshold: 3"))
            .times(1)
            .return_const(true);

        let mut rig = Rig::new(
            |c| c["multi_fan_fail"] = json!({"data": [[2, 70]], "host_action": ["shutdown", 3]}),
            Box::new(callouts),
        );
        rig.io.set_file("/sys/fan0_input", "0");
        rig.io.set_file("/sys/fan1_input", "0");
        rig.tick();
        assert_eq!(rig.pwm(2).as_deref(), Some("70"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));

        rig.io.set_file("/sys/fan2_input", "0");
        rig.tick();
        assert_eq!(rig.pwm(2).as_deref(), Some("70"));
    }

    #[test]
    fn test_limited_boost_caps_only_without_dead_fans() {
        let mut rig = Rig::new(
            |c| {
                c["non_fanfail_limited_boost_value"] = json!(45);
                c["boost"] = json!({"progressive": true, "sensor_fail": true});
            },
            Box::new(NoopCallouts),
        );
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("45"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Normal));

        // Dead fans lift the cap and the zone's own boost mode is not recorded
        rig.io.set_file("/sys/fan1_input", "0");
        rig.io.set_command(DUMP_COMMAND, "cpu_temp (0x1) : NA | (na)");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("100"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Normal));
    }

    #[test]
    fn test_sensor_alarm_boosts_every_zone() {
        let mut callouts = MockBoardCallouts::new();
        callouts
            .expect_host_action()
            .with(eq("host_shutdown"), eq("cpu_temp(alarm_major v=65) limit(t=60) reached"))
            .times(1)
            .return_const(true);

        let mut rig = Rig::new(
            |c| {
                c["enable_fsc_sensor_check"] = json!(true);
                c["sensors"]["mb"]["cpu_temp"]["read_limit"] =
                    json!({"alarm_major": {"limit": 60, "action": "host_shutdown"}});
            },
            Box::new(callouts),
        );
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("100"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Boost));

        rig.io.set_command(DUMP_COMMAND, "cpu_temp (0x1) : 55.00 C | (ok)");
        rig.tick();
        assert_eq!(rig.pwm(0).as_deref(), Some("20"));
        assert_eq!(rig.records().read_mode(0), Some(FanMode::Normal));
    }

    #[test]
    fn test_rearm_reports_dead_fans_again() {
        let mut rig = Rig::new(|_| {}, Box::new(NoopCallouts));
        let records = rig.records();
        let kv = rig.dir.path().join("kv");
        std::fs::create_dir_all(&kv).unwrap();

        rig.io.set_file("/sys/fan1_input", "0");
        rig.tick();
        assert!(records.fan_fail_path("Fan 1").exists());

        std::fs::remove_file(records.fan_fail_path("Fan 1")).unwrap();
        rig.tick();
        assert!(!records.fan_fail_path("Fan 1").exists());

        std::fs::write(kv.join(FAN_DEAD_REARM_KEY), "1").unwrap();
        rig.tick();
        assert!(records.fan_fail_path("Fan 1").exists());
        assert_eq!(std::fs::read_to_string(kv.join(FAN_DEAD_REARM_KEY)).unwrap(), "0");
    }

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_shutdown_boosts_and_disarms_watchdog() {
        let sink = Sink::default();
        let mut rig = Rig::new(|_| {}, Box::new(NoopCallouts));
        rig.driver.watchdog = Some(Watchdog::new(Box::new(sink.clone())));
        rig.driver.kick_watchdog();
        rig.driver.shutdown(true);

        for fan in 0..3 {
            assert_eq!(rig.pwm(fan).as_deref(), Some("100"));
        }
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"\0V");
    }
}
