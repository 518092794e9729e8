//! Core data types for fscd
//!
//! Per-tick samples produced by the machine layer and the zone operating mode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Threshold status reported alongside a sensor reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorStatus {
    Ok,
    /// Upper non-critical
    Unc,
    /// Upper critical
    Ucr,
    /// Upper non-recoverable
    Unr,
    Lnc,
    Lcr,
    Lnr,
    /// Read failed
    Na,
}

impl SensorStatus {
    /// Parse the status column of a sensor dump line
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "ok" => Some(Self::Ok),
            "unc" => Some(Self::Unc),
            "ucr" => Some(Self::Ucr),
            "unr" => Some(Self::Unr),
            "lnc" => Some(Self::Lnc),
            "lcr" => Some(Self::Lcr),
            "lnr" => Some(Self::Lnr),
            "na" => Some(Self::Na),
            _ => None,
        }
    }
}

/// One sensor sample for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    pub id: Option<u32>,
    pub name: String,
    /// `None` means unreadable and must stay absent (never zero) downstream
    pub value: Option<f64>,
    pub unit: Option<String>,
    pub status: Option<SensorStatus>,
    pub read_fail_count: u32,
    pub wrong_read_count: u32,
}

impl SensorValue {
    /// A successful reading with `ok` status
    pub fn ok(name: impl Into<String>, value: f64) -> Self {
        Self {
            id: None,
            name: name.into(),
            value: Some(value),
            unit: None,
            status: Some(SensorStatus::Ok),
            read_fail_count: 0,
            wrong_read_count: 0,
        }
    }

    /// An unreadable sample (`na` status, absent value)
    pub fn na(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            value: None,
            unit: None,
            status: Some(SensorStatus::Na),
            read_fail_count: 0,
            wrong_read_count: 0,
        }
    }

    pub fn with_status(mut self, status: SensorStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Sensor name -> sample
pub type BoardSensors = BTreeMap<String, SensorValue>;

/// Board -> sensor name -> sample, fully replaced every tick
pub type SensorMap = BTreeMap<String, BoardSensors>;

/// One tachometer sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanReading {
    pub fan_id: String,
    pub rpm: Option<u32>,
}

impl FanReading {
    /// Unreadable or below the minimum counts as dead
    pub fn is_dead(&self, min_rpm: u32) -> bool {
        self.rpm.map_or(true, |rpm| rpm < min_rpm)
    }
}

/// Operating mode recorded per zone (value persisted to disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FanMode {
    #[default]
    Normal,
    Transitional,
    Boost,
    /// Failed M.2 devices are handled through the SSD offset table
    Progressive,
}

impl FanMode {
    /// On-disk record value
    pub fn record_value(self) -> u8 {
        match self {
            FanMode::Normal => 0,
            FanMode::Transitional => 1,
            FanMode::Boost => 2,
            FanMode::Progressive => 3,
        }
    }
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FanMode::Normal => "normal",
            FanMode::Transitional => "transitional",
            FanMode::Boost => "boost",
            FanMode::Progressive => "progressive",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(SensorStatus::parse("UCR"), Some(SensorStatus::Ucr));
        assert_eq!(SensorStatus::parse(" na "), Some(SensorStatus::Na));
        assert_eq!(SensorStatus::parse("weird"), None);
    }

    #[test]
    fn test_fan_dead_when_unreadable_or_slow() {
        let slow = FanReading { fan_id: "0".into(), rpm: Some(500) };
        let missing = FanReading { fan_id: "1".into(), rpm: None };
        let fine = FanReading { fan_id: "2".into(), rpm: Some(5000) };
        assert!(slow.is_dead(800));
        assert!(missing.is_dead(800));
        assert!(!fine.is_dead(800));
    }

    #[test]
    fn test_mode_record_values() {
        assert_eq!(FanMode::Normal.record_value(), 0);
        assert_eq!(FanMode::Transitional.record_value(), 1);
        assert_eq!(FanMode::Boost.record_value(), 2);
        assert_eq!(FanMode::Progressive.record_value(), 3);
    }
}
