//! Controller profiles and the per-tick controller interface

use serde::{Deserialize, Serialize};

use crate::engine::pid::{Feedforward, IncrementPid, IndependentPid, Pid};
use crate::engine::table::{CurveSelection, TablePoint, ThresholdTable, ThresholdTable4Curve};
use crate::error::{FscError, Result};

/// Per-tick inputs that are not the measured value itself
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickContext {
    /// Seconds since the previous tick (0 on the first tick)
    pub dt: f64,
    /// Dead fans counted by the driver this tick
    pub dead_fan_count: u32,
    /// Duty most recently commanded for the zone being evaluated
    pub last_pwm: f64,
}

/// Controller profile as written in the configuration, keyed on `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProfileSpec {
    #[serde(rename = "pid")]
    Pid {
        setpoint: f64,
        #[serde(default)]
        kp: f64,
        #[serde(default)]
        ki: f64,
        #[serde(default)]
        kd: f64,
        #[serde(default)]
        negative_hysteresis: f64,
        #[serde(default)]
        positive_hysteresis: f64,
        #[serde(default)]
        windup_limit: Option<f64>,
    },

    #[serde(rename = "incrementpid")]
    IncrementPid {
        setpoint: f64,
        #[serde(default)]
        kp: f64,
        #[serde(default)]
        ki: f64,
        #[serde(default)]
        kd: f64,
    },

    #[serde(rename = "linear")]
    Linear {
        data: Vec<TablePoint>,
        #[serde(default)]
        negative_hysteresis: f64,
        #[serde(default)]
        positive_hysteresis: f64,
    },

    #[serde(rename = "linear_4curve")]
    Linear4Curve {
        data_normal_up: Vec<TablePoint>,
        data_normal_down: Vec<TablePoint>,
        data_onefail_up: Vec<TablePoint>,
        data_onefail_down: Vec<TablePoint>,
        #[serde(default)]
        negative_hysteresis: f64,
        #[serde(default)]
        positive_hysteresis: f64,
    },

    #[serde(rename = "independentpid")]
    IndependentPid {
        setpoint: f64,
        #[serde(default)]
        kp: f64,
        #[serde(default)]
        ki: f64,
        #[serde(default)]
        kd: f64,
        #[serde(default)]
        negative_hysteresis: f64,
        #[serde(default)]
        positive_hysteresis: f64,
        #[serde(default)]
        positive_slew: f64,
        #[serde(default)]
        negative_slew: f64,
        #[serde(default)]
        minimum_outval: f64,
    },

    #[serde(rename = "feedforward")]
    Feedforward { kf: f64 },
}

impl ProfileSpec {
    /// Short type name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ProfileSpec::Pid { .. } => "pid",
            ProfileSpec::IncrementPid { .. } => "incrementpid",
            ProfileSpec::Linear { .. } => "linear",
            ProfileSpec::Linear4Curve { .. } => "linear_4curve",
            ProfileSpec::IndependentPid { .. } => "independentpid",
            ProfileSpec::Feedforward { .. } => "feedforward",
        }
    }

    fn check_finite(name: &str, values: &[f64]) -> Result<()> {
        if values.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(FscError::invalid_profile(name, "parameters must be finite numbers"))
        }
    }
}

/// A stateful controller built from a profile
///
/// Every controller receives the measured value plus the tick context and
/// returns an output, or `None` when it has nothing to contribute this tick.
#[derive(Debug, Clone)]
pub enum Controller {
    Pid(Pid),
    IncrementPid(IncrementPid),
    Table(ThresholdTable),
    Table4Curve(ThresholdTable4Curve),
    IndependentPid(IndependentPid),
    Feedforward(Feedforward),
}

impl Controller {
    /// Build a fresh controller instance from a profile
    pub fn from_profile(name: &str, spec: &ProfileSpec) -> Result<Self> {
        let controller = match spec {
            ProfileSpec::Pid {
                setpoint,
                kp,
                ki,
                kd,
                negative_hysteresis,
                positive_hysteresis,
                windup_limit,
            } => {
                ProfileSpec::check_finite(name, &[*setpoint, *kp, *ki, *kd, *negative_hysteresis, *positive_hysteresis])?;
                Controller::Pid(
                    Pid::new(*setpoint, *kp, *ki, *kd, *negative_hysteresis, *positive_hysteresis)
                        .with_windup_limit(*windup_limit),
                )
            }
            ProfileSpec::IncrementPid { setpoint, kp, ki, kd } => {
                ProfileSpec::check_finite(name, &[*setpoint, *kp, *ki, *kd])?;
                Controller::IncrementPid(IncrementPid::new(*setpoint, *kp, *ki, *kd))
            }
            ProfileSpec::Linear {
                data,
                negative_hysteresis,
                positive_hysteresis,
            } => Controller::Table(ThresholdTable::new(
                name,
                data.clone(),
                *negative_hysteresis,
                *positive_hysteresis,
            )?),
            ProfileSpec::Linear4Curve {
                data_normal_up,
                data_normal_down,
                data_onefail_up,
                data_onefail_down,
                negative_hysteresis,
                positive_hysteresis,
            } => Controller::Table4Curve(ThresholdTable4Curve::new(
                name,
                data_normal_up.clone(),
                data_normal_down.clone(),
                data_onefail_up.clone(),
                data_onefail_down.clone(),
                *negative_hysteresis,
                *positive_hysteresis,
            )?),
            ProfileSpec::IndependentPid {
                setpoint,
                kp,
                ki,
                kd,
                negative_hysteresis,
                positive_hysteresis,
                positive_slew,
                negative_slew,
                minimum_outval,
            } => {
                ProfileSpec::check_finite(
                    name,
                    &[
                        *setpoint,
                        *kp,
                        *ki,
                        *kd,
                        *negative_hysteresis,
                        *positive_hysteresis,
                        *positive_slew,
                        *negative_slew,
                        *minimum_outval,
                    ],
                )?;
                Controller::IndependentPid(IndependentPid::new(
                    *setpoint,
                    *kp,
                    *ki,
                    *kd,
                    *negative_hysteresis,
                    *positive_hysteresis,
                    *positive_slew,
                    *negative_slew,
                    *minimum_outval,
                ))
            }
            ProfileSpec::Feedforward { kf } => {
                ProfileSpec::check_finite(name, &[*kf])?;
                Controller::Feedforward(Feedforward::new(*kf))
            }
        };
        Ok(controller)
    }

    /// Advance the controller by one tick
    pub fn run(&mut self, measured: f64, ctx: &TickContext) -> Option<f64> {
        if !measured.is_finite() {
            return None;
        }
        let output = match self {
            Controller::Pid(c) => c.run(measured, ctx),
            Controller::IncrementPid(c) => c.run(measured, ctx),
            Controller::Table(c) => c.run(measured),
            Controller::Table4Curve(c) => c.run(measured, ctx.dead_fan_count),
            Controller::IndependentPid(c) => c.run(measured, ctx),
            Controller::Feedforward(c) => c.run(measured),
        };
        output.filter(|v| v.is_finite())
    }

    /// Curve currently selected by a four-curve table
    pub fn curve_selection(&self) -> Option<CurveSelection> {
        match self {
            Controller::Table4Curve(c) => c.selected(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parses_by_type() {
        let spec: ProfileSpec = serde_json::from_str(
            r#"{"type": "linear", "data": [[0, 30], [60, 70]], "positive_hysteresis": 2}"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), "linear");

        let mut controller = Controller::from_profile("cpu", &spec).unwrap();
        assert_eq!(controller.run(65.0, &TickContext::default()), Some(70.0));
    }

    #[test]
    fn test_unknown_profile_type_rejected() {
        let result: std::result::Result<ProfileSpec, _> =
            serde_json::from_str(r#"{"type": "fuzzy", "setpoint": 50}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_table_is_config_error() {
        let spec = ProfileSpec::Linear {
            data: vec![],
            negative_hysteresis: 0.0,
            positive_hysteresis: 0.0,
        };
        let err = Controller::from_profile("cpu", &spec).unwrap_err();
        assert!(matches!(err, FscError::InvalidProfile { .. }));
    }

    #[test]
    fn test_non_finite_measurement_yields_none() {
        let spec = ProfileSpec::Feedforward { kf: 1.0 };
        let mut controller = Controller::from_profile("ff", &spec).unwrap();
        assert_eq!(controller.run(f64::NAN, &TickContext::default()), None);
        assert_eq!(controller.run(f64::INFINITY, &TickContext::default()), None);
    }

    #[test]
    fn test_four_curve_selection_reported() {
        let spec: ProfileSpec = serde_json::from_str(
            r#"{
                "type": "linear_4curve",
                "data_normal_up": [[20, 20]],
                "data_normal_down": [[20, 20]],
                "data_onefail_up": [[20, 50]],
                "data_onefail_down": [[20, 50]]
            }"#,
        )
        .unwrap();
        let mut controller = Controller::from_profile("inlet", &spec).unwrap();
        let ctx = TickContext { dead_fan_count: 1, ..TickContext::default() };
        assert_eq!(controller.run(25.0, &ctx), Some(50.0));
        assert_eq!(controller.curve_selection(), Some(CurveSelection::OneFailRising));
    }
}
