//! Board inventory, per-tick sweeps and PWM output
//!
//! The machine owns every sensor source and fan channel. A sensor sweep
//! returns a fresh [`SensorMap`] each tick; nothing from the previous tick is
//! carried over except the sources' failure counters.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::FscConfig;
use crate::data::{BoardSensors, FanReading, SensorMap};
use crate::error::{FscError, Result};
use crate::hw::control::{read_fan_rpm, write_fan_duty, FanReadSpec, FanSpec};
use crate::hw::io::{render_template, SensorIo};
use crate::hw::sensor::{
    parse_fan_dump, parse_sensor_dump, AlarmHit, GuardTrip, ReadContext, SensorSource, SensorSpec, SourceSpec,
};

#[derive(Debug, Clone, PartialEq)]
enum Offset {
    None,
    Flat(f64),
    /// `(duty_threshold, offset)` ascending by threshold
    Table(Vec<(f64, f64)>),
}

impl Offset {
    fn from_spec(spec: &SensorSpec) -> Self {
        match (&spec.offset, &spec.offset_table) {
            (Some(flat), _) => Offset::Flat(*flat),
            (None, Some(table)) => {
                let mut table = table.clone();
                table.sort_by(|a, b| a.0.total_cmp(&b.0));
                Offset::Table(table)
            }
            (None, None) => Offset::None,
        }
    }

    /// Offset for the highest threshold not exceeding `last_pwm`
    fn amount(&self, last_pwm: f64) -> f64 {
        match self {
            Offset::None => 0.0,
            Offset::Flat(v) => *v,
            Offset::Table(table) => table
                .iter()
                .rev()
                .find(|(threshold, _)| *threshold <= last_pwm)
                .map_or(0.0, |(_, offset)| *offset),
        }
    }
}

#[derive(Debug)]
struct ConfiguredSensor {
    source: SensorSource,
    offset: Offset,
}

/// One fan output channel
#[derive(Debug, Clone)]
pub struct Fan {
    pub id: String,
    pub label: String,
    pub spec: FanSpec,
}

pub struct Machine {
    io: Arc<dyn SensorIo>,
    /// Boards in use, fixed after startup
    boards: BTreeSet<String>,
    sensors: BTreeMap<String, BTreeMap<String, ConfiguredSensor>>,
    /// Sorted by numeric id where ids are numeric
    fans: Vec<Fan>,
    sensor_dump_command: Option<String>,
    fan_dump_command: Option<String>,
    kv_dir: PathBuf,
    last_pwm: f64,
    guard_trips: Vec<GuardTrip>,
}

fn fan_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

impl Machine {
    /// Build the inventory; the initial "last commanded" duty is transitional
    pub fn from_config(config: &FscConfig, io: Arc<dyn SensorIo>) -> Self {
        let sensors = config
            .sensors
            .iter()
            .map(|(board, defs)| {
                let defs = defs
                    .iter()
                    .map(|(name, spec)| {
                        let source = SensorSource::new(name.clone(), spec.source.clone())
                            .with_unit(spec.unit.clone())
                            .with_read_limit(spec.read_limit.clone());
                        (name.clone(), ConfiguredSensor { source, offset: Offset::from_spec(spec) })
                    })
                    .collect();
                (board.clone(), defs)
            })
            .collect();

        let mut fans: Vec<Fan> = config
            .fans
            .iter()
            .map(|(id, spec)| Fan {
                id: id.clone(),
                label: spec.label.clone().unwrap_or_else(|| format!("Fan {}", id)),
                spec: spec.clone(),
            })
            .collect();
        fans.sort_by(|a, b| fan_order(&a.id, &b.id));

        Self {
            io,
            boards: BTreeSet::new(),
            sensors,
            fans,
            sensor_dump_command: config.sensor_dump_command.clone(),
            fan_dump_command: config.fan_dump_command.clone(),
            kv_dir: config.kv_dir.clone(),
            last_pwm: config.pwm_transition_value,
            guard_trips: Vec::new(),
        }
    }

    pub fn register_board(&mut self, board: impl Into<String>) {
        self.boards.insert(board.into());
    }

    pub fn boards(&self) -> &BTreeSet<String> {
        &self.boards
    }

    pub fn fans(&self) -> &[Fan] {
        &self.fans
    }

    pub fn fan(&self, fan_id: &str) -> Option<&Fan> {
        self.fans.iter().find(|f| f.id == fan_id)
    }

    pub fn last_pwm(&self) -> f64 {
        self.last_pwm
    }

    /// `(read_fail_count, wrong_read_count)` of a configured sensor
    pub fn sensor_counters(&self, board: &str, name: &str) -> Option<(u32, u32)> {
        let sensor = self.sensors.get(board)?.get(name)?;
        Some((sensor.source.read_fail_count(), sensor.source.wrong_read_count()))
    }

    /// Guards that fired since the last call
    pub fn take_guard_trips(&mut self) -> Vec<GuardTrip> {
        std::mem::take(&mut self.guard_trips)
    }

    fn board_dump(&self, board: &str) -> Option<BoardSensors> {
        let template = self.sensor_dump_command.as_ref()?;
        let command = render_template(template, &[("board", board)]);
        match self.io.run_command(&command) {
            Ok(stdout) => Some(parse_sensor_dump(&stdout)),
            Err(e) => {
                warn!("Sensor dump for board {} failed: {}", board, e);
                None
            }
        }
    }

    /// Sweep every registered board
    pub fn read_sensors(&mut self) -> SensorMap {
        let mut map = SensorMap::new();
        let boards: Vec<String> = self.boards.iter().cloned().collect();

        for board in boards {
            let dump = self.board_dump(&board);
            // Dump entries without a configured source come through as-is
            let mut board_map = dump.clone().unwrap_or_default();

            if let Some(configured) = self.sensors.get_mut(&board) {
                let ctx = ReadContext {
                    io: self.io.as_ref(),
                    kv_dir: &self.kv_dir,
                    dump: dump.as_ref(),
                };
                for (name, sensor) in configured.iter_mut() {
                    let sample = sensor.source.read(&ctx).map(|mut sample| {
                        if let Some(raw) = sample.value {
                            sample.value = Some(raw + sensor.offset.amount(self.last_pwm));
                        }
                        sample
                    });

                    let trips = sensor.source.check_guards(sample.as_ref());
                    self.guard_trips.extend(trips);

                    match sample {
                        Some(sample) => {
                            board_map.insert(name.clone(), sample);
                        }
                        None => {
                            // Configured dump sensor not reported this tick
                            if matches!(sensor.source.spec(), SourceSpec::Dump) {
                                board_map.remove(name);
                            }
                        }
                    }
                }
            }

            debug!(board = %board, sensors = board_map.len(), "Sensor sweep");
            map.insert(board, board_map);
        }

        map
    }

    /// Check alarm thresholds of registered boards against this tick's samples
    pub fn check_alarms(&mut self, sensors: &SensorMap, now: Instant) -> Vec<AlarmHit> {
        let mut hits = Vec::new();
        for (board, configured) in self.sensors.iter_mut() {
            if !self.boards.contains(board) {
                continue;
            }
            for (name, sensor) in configured.iter_mut() {
                let value = sensors.get(board).and_then(|b| b.get(name)).and_then(|s| s.value);
                hits.extend(sensor.source.check_alarms(value, now));
            }
        }
        hits
    }

    /// Sweep every fan tachometer
    pub fn read_fans(&self) -> Vec<FanReading> {
        let needs_dump = self.fans.iter().any(|f| matches!(f.spec.read, FanReadSpec::Dump));
        let dump = match (&self.fan_dump_command, needs_dump) {
            (Some(command), true) => match self.io.run_command(command) {
                Ok(stdout) => Some(parse_fan_dump(&stdout)),
                Err(e) => {
                    warn!("Fan speed dump failed: {}", e);
                    None
                }
            },
            _ => None,
        };

        self.fans
            .iter()
            .enumerate()
            .map(|(index, fan)| {
                let rpm = match &fan.spec.read {
                    FanReadSpec::Dump => dump.as_ref().and_then(|entries| {
                        let entry = match &fan.spec.dump_label {
                            Some(label) => entries.iter().find(|e| &e.label == label),
                            None => entries.get(index),
                        };
                        entry.map(|e| e.rpm)
                    }),
                    spec => match read_fan_rpm(self.io.as_ref(), &fan.id, spec) {
                        Ok(rpm) => Some(rpm),
                        Err(e) => {
                            warn!("{}", e);
                            None
                        }
                    },
                };
                FanReading { fan_id: fan.id.clone(), rpm }
            })
            .collect()
    }

    /// Command one fan
    pub fn set_pwm(&mut self, fan_id: &str, percent: f64) -> Result<()> {
        let fan = self.fan(fan_id).ok_or_else(|| FscError::UnknownReference {
            kind: "fan",
            name: fan_id.to_string(),
        })?;
        write_fan_duty(self.io.as_ref(), &fan.id, &fan.spec.write, percent)?;
        self.last_pwm = percent;
        Ok(())
    }

    /// Command every fan, attempting all even if some fail
    pub fn set_all_pwm(&mut self, percent: f64) -> Result<()> {
        let mut first_error = None;
        for fan in &self.fans {
            if let Err(e) = write_fan_duty(self.io.as_ref(), &fan.id, &fan.spec.write, percent) {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        self.last_pwm = percent;
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SensorStatus;
    use crate::test_utils::FakeIo;

    fn config(json_sensors: serde_json::Value, fans: serde_json::Value) -> FscConfig {
        let value = serde_json::json!({
            "sample_interval_ms": 1000,
            "sensor_dump_command": "sensor-util {board} --threshold",
            "fan_dump_command": "fan-util --get",
            "sensors": json_sensors,
            "fans": fans,
            "zones": [{"pwm_output": ["0"], "expr": {"var": "mb:cpu_temp"}}]
        });
        FscConfig::from_json(&value.to_string()).unwrap()
    }

    fn sysfs_fans() -> serde_json::Value {
        serde_json::json!({
            "0": {"read": {"type": "sysfs", "path": "/sys/fan0"}, "write": {"type": "sysfs", "path": "/sys/pwm0"}},
            "1": {"read": {"type": "sysfs", "path": "/sys/fan1"}, "write": {"type": "sysfs", "path": "/sys/pwm1"}}
        })
    }

    #[test]
    fn test_sweep_merges_dump_and_configured_sensors() {
        let io = FakeIo::new();
        io.set_command(
            "sensor-util mb --threshold",
            "MB_INLET_TEMP (0xA0) :   27.00 C | (ok)\nMB_CPU_TEMP (0xA1) :   70.00 C | (ok)\n",
        );
        io.set_file("/sys/vr_temp", "50");
        let cfg = config(
            serde_json::json!({"mb": {
                "MB_CPU_TEMP": {"source": {"type": "dump"}, "offset": -3},
                "vr_temp": {"source": {"type": "sysfs", "path": "/sys/vr_temp"}}
            }}),
            sysfs_fans(),
        );
        let mut machine = Machine::from_config(&cfg, Arc::new(io.clone()));
        machine.register_board("mb");

        let map = machine.read_sensors();
        let mb = &map["mb"];
        assert_eq!(mb["MB_INLET_TEMP"].value, Some(27.0));
        assert_eq!(mb["MB_CPU_TEMP"].value, Some(67.0));
        assert_eq!(mb["vr_temp"].value, Some(50.0));
        assert_eq!(mb["vr_temp"].status, Some(SensorStatus::Ok));
    }

    #[test]
    fn test_offset_table_follows_last_pwm() {
        let io = FakeIo::new();
        io.set_file("/sys/inlet", "30");
        let cfg = config(
            serde_json::json!({"mb": {
                "inlet": {"source": {"type": "sysfs", "path": "/sys/inlet"},
                          "offset_table": [[0, -1], [50, -2], [80, -4]]}
            }}),
            sysfs_fans(),
        );
        let mut machine = Machine::from_config(&cfg, Arc::new(io.clone()));
        machine.register_board("mb");

        // Starts at transitional (70)
        assert_eq!(machine.read_sensors()["mb"]["inlet"].value, Some(28.0));
        machine.set_all_pwm(90.0).unwrap();
        assert_eq!(machine.read_sensors()["mb"]["inlet"].value, Some(26.0));

        // Absent values stay absent
        io.remove_file("/sys/inlet");
        assert_eq!(machine.read_sensors()["mb"]["inlet"].value, None);
        assert_eq!(machine.sensor_counters("mb", "inlet"), Some((1, 0)));
    }

    #[test]
    fn test_missing_dump_sensor_is_absent_from_map() {
        let io = FakeIo::new();
        io.set_command("sensor-util mb --threshold", "MB_INLET_TEMP (0xA0) :   27.00 C | (ok)\n");
        let cfg = config(serde_json::json!({"mb": {"cpu_temp": {"source": {"type": "dump"}}}}), sysfs_fans());
        let mut machine = Machine::from_config(&cfg, Arc::new(io.clone()));
        machine.register_board("mb");
        let map = machine.read_sensors();
        assert!(!map["mb"].contains_key("cpu_temp"));
    }

    #[test]
    fn test_fan_dump_positional_and_by_label() {
        let io = FakeIo::new();
        io.set_command("fan-util --get", "Fan 0 Speed: 5000 RPM (40%)\nFan 1 Speed: 300 RPM (40%)\nFan 10 Speed: 4000 RPM (40%)\n");
        let fans = serde_json::json!({
            "10": {"read": {"type": "dump"}, "write": {"type": "sysfs", "path": "/sys/pwm10"}},
            "0": {"read": {"type": "dump"}, "write": {"type": "sysfs", "path": "/sys/pwm0"}},
            "1": {"read": {"type": "dump"}, "write": {"type": "sysfs", "path": "/sys/pwm1"}, "dump_label": "1"}
        });
        let cfg = config(serde_json::json!({}), fans);
        let machine = Machine::from_config(&cfg, Arc::new(io.clone()));

        let readings = machine.read_fans();
        let ids: Vec<&str> = readings.iter().map(|r| r.fan_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "10"]);
        assert_eq!(readings[0].rpm, Some(5000));
        assert_eq!(readings[1].rpm, Some(300));
        assert_eq!(readings[2].rpm, Some(4000));
    }

    #[test]
    fn test_unreadable_fan_has_no_rpm() {
        let io = FakeIo::new();
        io.set_file("/sys/fan0", "5200");
        let cfg = config(serde_json::json!({}), sysfs_fans());
        let machine = Machine::from_config(&cfg, Arc::new(io.clone()));
        let readings = machine.read_fans();
        assert_eq!(readings[0].rpm, Some(5200));
        assert_eq!(readings[1].rpm, None);
        assert_eq!(machine.fan("1").unwrap().label, "Fan 1");
    }

    #[test]
    fn test_pwm_writes_update_last_pwm() {
        let io = FakeIo::new();
        let cfg = config(serde_json::json!({}), sysfs_fans());
        let mut machine = Machine::from_config(&cfg, Arc::new(io.clone()));

        machine.set_all_pwm(100.0).unwrap();
        assert_eq!(io.last_write("/sys/pwm0").as_deref(), Some("100"));
        assert_eq!(io.last_write("/sys/pwm1").as_deref(), Some("100"));

        machine.set_pwm("1", 45.0).unwrap();
        assert_eq!(io.last_write("/sys/pwm1").as_deref(), Some("45"));
        assert_eq!(machine.last_pwm(), 45.0);
        assert!(machine.set_pwm("9", 45.0).is_err());
    }

    #[test]
    fn test_alarms_use_offset_corrected_values() {
        let io = FakeIo::new();
        io.set_file("/sys/inlet", "52");
        let cfg = config(
            serde_json::json!({"mb": {
                "inlet": {"source": {"type": "sysfs", "path": "/sys/inlet"}, "offset": -4,
                          "read_limit": {"alarm_major": {"limit": 50, "action": "host_shutdown"}}}
            }}),
            sysfs_fans(),
        );
        let mut machine = Machine::from_config(&cfg, Arc::new(io.clone()));
        machine.register_board("mb");

        let now = Instant::now();
        let map = machine.read_sensors();
        assert!(machine.check_alarms(&map, now).is_empty());

        io.set_file("/sys/inlet", "55");
        let map = machine.read_sensors();
        let hits = machine.check_alarms(&map, now);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].action.as_deref(), Some("host_shutdown"));
        assert_eq!(hits[0].cause, "inlet(alarm_major v=51) limit(t=50) reached");
    }
}
