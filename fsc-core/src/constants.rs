//! Constants and configuration defaults for fscd
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! Config deserialization falls back to these values for every optional key.

/// Filesystem locations
pub mod paths {
    /// Default parsed configuration file
    pub const CONFIG_FILE: &str = "/etc/fsc-config.json";

    /// Directory holding per-zone mode records and shared boost markers
    pub const RECORD_DIR: &str = "/tmp/cache_store";

    /// Directory holding one marker per failing sensor variable
    pub const SENSOR_FAIL_RECORD_DIR: &str = "/tmp/sensorfail_record";

    /// Directory holding one marker per dead fan
    pub const FAN_FAIL_RECORD_DIR: &str = "/tmp/fanfail_record";

    /// Key-value cache directory (one file per key)
    pub const KV_DIR: &str = "/tmp/cache_store/kv";

    /// Hardware watchdog device
    pub const WATCHDOG_DEVICE: &str = "/dev/watchdog";

    /// Marker names inside RECORD_DIR
    pub const SENSOR_FAIL_BOOST_MARKER: &str = "sensor_fail_boost";
    pub const FAN_FAIL_BOOST_MARKER: &str = "fan_fail_boost";

    /// Default helper-process sensor dump, `{board}` is substituted
    pub const SENSOR_DUMP_COMMAND: &str = "/usr/local/bin/sensor-util {board} --threshold";
}

/// Duty cycle defaults (percent)
pub mod duty {
    pub const MIN: f64 = 0.0;
    pub const MAX: f64 = 100.0;

    /// Fail-safe output
    pub const DEFAULT_BOOST: f64 = 100.0;

    /// Output when no sane value can be computed
    pub const DEFAULT_TRANSITIONAL: f64 = 70.0;

    /// Maximum per-tick change
    pub const DEFAULT_RAMP_RATE: f64 = 10.0;

    /// Progressive dead-fan boost: (max dead fans, increment per dead fan)
    pub const DEFAULT_FAN_DEAD_BOOST: &[(u32, f64)] = &[(2, 10.0)];

    /// Duty register full-scale value for fan outputs
    pub const DEFAULT_MAX_DUTY_REGISTER: f64 = 100.0;
}

/// Fan tachometer defaults
pub mod fan {
    /// Below this a fan is considered dead
    pub const DEFAULT_MIN_RPM: u32 = 800;
}

/// Timing values
pub mod timing {
    /// Warm-up after startup when fan power sequencing is in play
    pub const DEFAULT_FANPOWER_WARMUP_S: u64 = 30;

    /// Hardware watchdog timeout the sample interval is checked against
    pub const DEFAULT_WATCHDOG_TIMEOUT_S: u64 = 30;
}

/// Zone debounce values
pub mod zone {
    /// Consecutive misses before a missing-sensor condition is asserted
    pub const MISSING_SENSOR_RETRIES: u8 = 2;

    /// Sensor name patterns that get progressive (SSD-style) failure handling
    pub const DEFAULT_SSD_PATTERNS: &[&str] = &["^SSD", "temp_dev"];

    /// Sensor names containing this are M.2 device temperatures
    pub const M2_SENSOR_MARKER: &str = "temp_dev";
}

/// Watchdog bytes
pub mod watchdog {
    /// Any write other than the magic close byte keeps the timer alive
    pub const KEEPALIVE: &[u8] = b"\0";

    /// Magic close byte: disarms the timer when the device is closed
    pub const DISARM: &[u8] = b"V";
}
