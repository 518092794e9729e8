//! Failure-count bucket tables
//!
//! Two independently tuned tables share this shape: the dead-fan overlay in
//! the driver and the per-zone failed-SSD offset. Each is an ordered list of
//! `(max_count, amount)` buckets where the first bucket whose `max_count`
//! covers the current count applies. Counts beyond the last bucket escalate to
//! boost.

use serde::{Deserialize, Serialize};

use crate::constants::duty;
use crate::data::FanMode;

/// Ordered `(max_count, amount)` buckets
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BucketTable(Vec<(u32, f64)>);

impl BucketTable {
    pub fn new(mut buckets: Vec<(u32, f64)>) -> Self {
        buckets.sort_by_key(|(count, _)| *count);
        Self(buckets)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Amount for the first bucket covering `count`, `None` when beyond all buckets
    pub fn lookup(&self, count: u32) -> Option<f64> {
        // Config-deserialized tables may be unsorted
        self.0
            .iter()
            .filter(|(max_count, _)| count <= *max_count)
            .min_by_key(|(max_count, _)| *max_count)
            .map(|(_, amount)| *amount)
    }
}

/// How the driver reacts to dead fans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanDeadPolicy {
    /// Any dead fan means boost
    #[default]
    Immediate,
    /// Raise each zone's duty per dead fan, boost beyond the table
    Progressive,
}

/// Duties by dead fan count that replace the immediate boost once two or more fans die
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiFanFail {
    /// `(min_dead_fans, duty)` rows
    pub data: Vec<(u32, f64)>,
    /// `["shutdown", min_dead_fans]`
    #[serde(default)]
    pub host_action: Option<(String, u32)>,
}

impl MultiFanFail {
    /// Highest duty among rows whose count is reached
    pub fn floor(&self, dead_fans: u32) -> Option<f64> {
        self.data
            .iter()
            .filter(|(count, _)| dead_fans >= *count)
            .map(|(_, duty)| *duty)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))))
    }

    pub fn shutdown_threshold(&self) -> Option<u32> {
        match &self.host_action {
            Some((action, count)) if action == "shutdown" => Some(*count),
            _ => None,
        }
    }
}

/// Dead-fan overlay applied to every zone's output
#[derive(Debug, Clone)]
pub struct DeadFanOverlay {
    pub policy: FanDeadPolicy,
    pub table: BucketTable,
    pub boost: f64,
    /// With immediate policy, keep a zone output above boost instead of capping to it
    pub output_max_boost: bool,
    pub multi_fan_fail: Option<MultiFanFail>,
    /// Immediate-policy duty while fan power is off
    pub standby_pwm: Option<f64>,
}

impl DeadFanOverlay {
    /// Adjusted duty, plus the mode to force if the overlay escalated
    pub fn apply(&self, pwm: f64, dead_fans: u32, fan_power_on: bool) -> (f64, Option<FanMode>) {
        if dead_fans == 0 {
            return (pwm, None);
        }

        match self.policy {
            FanDeadPolicy::Progressive => match self.table.lookup(dead_fans) {
                Some(rate) => ((pwm + dead_fans as f64 * rate).clamp(duty::MIN, duty::MAX), None),
                None => (self.boost, Some(FanMode::Boost)),
            },
            FanDeadPolicy::Immediate => {
                if let (Some(standby), false) = (self.standby_pwm, fan_power_on) {
                    return (standby, Some(FanMode::Boost));
                }
                if let (Some(multi), true) = (&self.multi_fan_fail, dead_fans > 1) {
                    return match multi.floor(dead_fans) {
                        Some(floor) if pwm <= floor => (floor, Some(FanMode::Boost)),
                        _ => (pwm, None),
                    };
                }
                let pwm = if self.output_max_boost { pwm.max(self.boost) } else { self.boost };
                (pwm, Some(FanMode::Boost))
            }
        }
    }
}
