//! PID family controllers
//!
//! Gain sign convention: the error term is `threshold - measured`, so a
//! temperature above the band produces a negative error. Profiles that should
//! raise the duty cycle as temperature climbs therefore carry negative gains.

use crate::constants::duty;
use crate::engine::TickContext;

/// Threshold-gated positional PID
///
/// Below `setpoint - neg_hyst` the integral resets and the controller reports
/// "no change". Above `setpoint + pos_hyst` it recomputes; in between it holds
/// the last output.
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    minval: f64,
    maxval: f64,
    /// Symmetric clamp on the accumulated integral
    windup_limit: Option<f64>,
    integral: f64,
    last_error: f64,
    last_output: Option<f64>,
}

impl Pid {
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64, neg_hyst: f64, pos_hyst: f64) -> Self {
        Self {
            kp,
            ki,
            kd,
            minval: setpoint - neg_hyst.abs(),
            maxval: setpoint + pos_hyst.abs(),
            windup_limit: None,
            integral: 0.0,
            last_error: 0.0,
            last_output: None,
        }
    }

    pub fn with_windup_limit(mut self, limit: Option<f64>) -> Self {
        self.windup_limit = limit.map(f64::abs);
        self
    }

    pub fn run(&mut self, measured: f64, ctx: &TickContext) -> Option<f64> {
        if measured < self.minval {
            self.integral = 0.0;
            self.last_output = None;
            return None;
        }

        // After a reset there is nothing to hold, so recompute inside the band too
        if measured > self.maxval || self.last_output.is_none() {
            let error = self.maxval - measured;
            let derivative = if ctx.dt > 0.0 {
                self.integral += error * ctx.dt;
                (error - self.last_error) / ctx.dt
            } else {
                0.0
            };
            if let Some(limit) = self.windup_limit {
                self.integral = self.integral.clamp(-limit, limit);
            }

            let output = self.kp * error + self.ki * self.integral + self.kd * derivative;
            self.last_error = error;
            self.last_output = Some(output);
        }

        self.last_output
    }
}

/// Velocity-form PID built on the zone's last commanded duty
#[derive(Debug, Clone)]
pub struct IncrementPid {
    setpoint: f64,
    kp: f64,
    ki: f64,
    kd: f64,
    prev_value: Option<f64>,
    prev2_value: Option<f64>,
}

impl IncrementPid {
    pub fn new(setpoint: f64, kp: f64, ki: f64, kd: f64) -> Self {
        Self {
            setpoint,
            kp,
            ki,
            kd,
            prev_value: None,
            prev2_value: None,
        }
    }

    pub fn run(&mut self, measured: f64, ctx: &TickContext) -> Option<f64> {
        // First samples have no history: differences start at zero
        let prev = self.prev_value.unwrap_or(measured);
        let prev2 = self.prev2_value.unwrap_or(prev);

        let output = ctx.last_pwm
            + self.kp * (measured - prev)
            + self.ki * (measured - self.setpoint)
            + self.kd * (measured - 2.0 * prev + prev2);

        self.prev2_value = Some(prev);
        self.prev_value = Some(measured);

        Some(output.clamp(duty::MIN, duty::MAX))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Below,
    Inside,
    Above,
}

/// PI(D) with a hold band, slew limiting and an output floor
///
/// Output moves relative to the value held when the measurement left the
/// band, so leaving the band never causes a jump.
#[derive(Debug, Clone)]
pub struct IndependentPid {
    kp: f64,
    ki: f64,
    kd: f64,
    minval: f64,
    maxval: f64,
    /// Max rise per second, 0 = unlimited
    positive_slew: f64,
    /// Max fall per second, 0 = unlimited
    negative_slew: f64,
    minimum_outval: f64,
    integral: f64,
    last_error: f64,
    base: f64,
    last_output: f64,
    region: Region,
}

impl IndependentPid {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        setpoint: f64,
        kp: f64,
        ki: f64,
        kd: f64,
        neg_hyst: f64,
        pos_hyst: f64,
        positive_slew: f64,
        negative_slew: f64,
        minimum_outval: f64,
    ) -> Self {
        let minimum_outval = minimum_outval.clamp(duty::MIN, duty::MAX);
        Self {
            kp,
            ki,
            kd,
            minval: setpoint - neg_hyst.abs(),
            maxval: setpoint + pos_hyst.abs(),
            positive_slew: positive_slew.abs(),
            negative_slew: negative_slew.abs(),
            minimum_outval,
            integral: 0.0,
            last_error: 0.0,
            base: minimum_outval,
            last_output: minimum_outval,
            region: Region::Inside,
        }
    }

    fn clamp_output(&self, value: f64) -> f64 {
        value.clamp(self.minimum_outval, duty::MAX)
    }

    pub fn run(&mut self, measured: f64, ctx: &TickContext) -> Option<f64> {
        let region = if measured > self.maxval {
            Region::Above
        } else if measured < self.minval {
            Region::Below
        } else {
            Region::Inside
        };

        if region == Region::Inside {
            self.region = region;
            return Some(self.clamp_output(self.last_output));
        }

        let error = match region {
            Region::Above => self.maxval - measured,
            _ => self.minval - measured,
        };

        if region != self.region {
            self.integral = 0.0;
            self.last_error = error;
            self.base = self.last_output;
            self.region = region;
        }

        let derivative = if ctx.dt > 0.0 {
            self.integral += error * ctx.dt;
            (error - self.last_error) / ctx.dt
        } else {
            0.0
        };
        self.last_error = error;

        let target = self.base + self.kp * error + self.ki * self.integral + self.kd * derivative;
        let mut delta = target - self.last_output;
        if ctx.dt > 0.0 {
            if self.positive_slew > 0.0 {
                delta = delta.min(self.positive_slew * ctx.dt);
            }
            if self.negative_slew > 0.0 {
                delta = delta.max(-self.negative_slew * ctx.dt);
            }
        }

        self.last_output = self.clamp_output(self.last_output + delta);
        Some(self.last_output)
    }
}

/// Stateless proportional feed-forward term
#[derive(Debug, Clone)]
pub struct Feedforward {
    kf: f64,
}

impl Feedforward {
    pub fn new(kf: f64) -> Self {
        Self { kf }
    }

    pub fn run(&self, measured: f64) -> Option<f64> {
        Some(self.kf * measured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(dt: f64) -> TickContext {
        TickContext { dt, ..TickContext::default() }
    }

    #[test]
    fn test_pid_dead_band_then_proportional() {
        let mut pid = Pid::new(50.0, 1.0, 0.0, 0.0, 0.0, 5.0);
        assert_eq!(pid.run(40.0, &tick(1.0)), None);
        assert_eq!(pid.run(45.0, &tick(1.0)), None);
        let out = pid.run(52.0, &tick(1.0)).unwrap();
        assert!((out - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pid_holds_inside_band_and_resets_below() {
        let mut pid = Pid::new(50.0, -2.0, 0.0, 0.0, 0.0, 5.0);
        let above = pid.run(60.0, &tick(1.0)).unwrap();
        assert!((above - 10.0).abs() < 1e-9);
        // Back inside the band: held
        assert_eq!(pid.run(53.0, &tick(1.0)), Some(above));
        // Below the band: reset
        assert_eq!(pid.run(49.0, &tick(1.0)), None);
    }

    #[test]
    fn test_pid_integral_accumulates_and_is_bounded() {
        let mut pid = Pid::new(50.0, 0.0, -1.0, 0.0, 0.0, 0.0).with_windup_limit(Some(5.0));
        pid.run(52.0, &tick(1.0));
        pid.run(52.0, &tick(1.0));
        let out = pid.run(52.0, &tick(1.0)).unwrap();
        assert!((out - 5.0).abs() < 1e-9, "integral clamped to 5, got {}", out);
    }

    #[test]
    fn test_pid_zero_dt_does_not_divide() {
        let mut pid = Pid::new(50.0, -1.0, -1.0, -1.0, 0.0, 0.0);
        let out = pid.run(55.0, &tick(0.0)).unwrap();
        assert!(out.is_finite());
    }

    #[test]
    fn test_increment_pid_tracks_caller_duty() {
        let mut pid = IncrementPid::new(60.0, 1.0, 0.5, 0.0);
        let ctx = TickContext { dt: 1.0, dead_fan_count: 0, last_pwm: 40.0 };
        // First call: no history, only the integral-like term
        let out = pid.run(64.0, &ctx).unwrap();
        assert!((out - 42.0).abs() < 1e-9);

        let ctx = TickContext { last_pwm: 35.0, ..ctx };
        let out = pid.run(66.0, &ctx).unwrap();
        // 35 + 1*(66-64) + 0.5*(66-60)
        assert!((out - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_increment_pid_clamps() {
        let mut pid = IncrementPid::new(0.0, 0.0, 10.0, 0.0);
        let ctx = TickContext { dt: 1.0, dead_fan_count: 0, last_pwm: 90.0 };
        assert_eq!(pid.run(50.0, &ctx), Some(100.0));
    }

    #[test]
    fn test_independent_pid_holds_inside_band() {
        let mut pid = IndependentPid::new(50.0, -1.0, 0.0, 0.0, 5.0, 5.0, 0.0, 0.0, 20.0);
        assert_eq!(pid.run(50.0, &tick(1.0)), Some(20.0));
        assert_eq!(pid.run(54.0, &tick(1.0)), Some(20.0));
    }

    #[test]
    fn test_independent_pid_drives_up_then_down_with_slew() {
        let mut pid = IndependentPid::new(50.0, -2.0, 0.0, 0.0, 5.0, 5.0, 5.0, 3.0, 20.0);
        // maxval 55, measured 65 -> target 20 + 20 = 40, slew caps the rise at 5/s
        assert_eq!(pid.run(65.0, &tick(1.0)), Some(25.0));
        assert_eq!(pid.run(65.0, &tick(1.0)), Some(30.0));

        // Inside: hold without mutation
        assert_eq!(pid.run(50.0, &tick(1.0)), Some(30.0));

        // minval 45, measured 40 -> error 5, target 30 - 10 = 20, fall capped at 3/s
        assert_eq!(pid.run(40.0, &tick(1.0)), Some(27.0));
    }

    #[test]
    fn test_independent_pid_never_below_floor() {
        let mut pid = IndependentPid::new(50.0, -10.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 15.0);
        assert_eq!(pid.run(0.0, &tick(1.0)), Some(15.0));
        assert_eq!(pid.run(200.0, &tick(1.0)), Some(100.0));
    }

    #[test]
    fn test_feedforward_is_linear() {
        let ff = Feedforward::new(0.5);
        assert_eq!(ff.run(80.0), Some(40.0));
    }
}
