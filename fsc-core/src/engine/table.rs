//! Threshold-table controllers
//!
//! A table maps "measured value at or above threshold" to an output duty.
//! Tables are kept sorted by descending threshold so the first match wins.
//!
//! # Hysteresis
//!
//! Once an output has been chosen, the controller keeps it while the measured
//! value stays within `[compared - neg_hyst, compared + pos_hyst]` of the value
//! that produced it. The compared value only moves when the output is
//! recomputed, so a slow drift cannot walk the band along with it.

use crate::error::{FscError, Result};

/// One `(threshold, output)` row
pub type TablePoint = (f64, f64);

/// Validate and sort a table, highest threshold first
fn prepare_table(name: &str, mut points: Vec<TablePoint>) -> Result<Vec<TablePoint>> {
    if points.is_empty() {
        return Err(FscError::invalid_profile(name, "threshold table is empty"));
    }
    if points.iter().any(|(t, o)| !t.is_finite() || !o.is_finite()) {
        return Err(FscError::invalid_profile(name, "threshold table contains non-finite values"));
    }
    points.sort_by(|a, b| b.0.total_cmp(&a.0));
    Ok(points)
}

/// First row whose threshold the value reaches, else the lowest row
fn lookup(table: &[TablePoint], value: f64) -> f64 {
    table
        .iter()
        .find(|(threshold, _)| value >= *threshold)
        .or_else(|| table.last())
        .map(|(_, output)| *output)
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default)]
struct Hysteresis {
    neg: f64,
    pos: f64,
    compared: Option<f64>,
}

impl Hysteresis {
    fn new(neg: f64, pos: f64) -> Self {
        Self {
            neg: neg.abs(),
            pos: pos.abs(),
            compared: None,
        }
    }

    fn holds(&self, value: f64) -> bool {
        match self.compared {
            Some(c) => value >= c - self.neg && value <= c + self.pos,
            None => false,
        }
    }
}

/// Stepwise table with hysteresis ("linear" profiles)
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    table: Vec<TablePoint>,
    hysteresis: Hysteresis,
    last_output: Option<f64>,
}

impl ThresholdTable {
    pub fn new(name: &str, points: Vec<TablePoint>, neg_hyst: f64, pos_hyst: f64) -> Result<Self> {
        Ok(Self {
            table: prepare_table(name, points)?,
            hysteresis: Hysteresis::new(neg_hyst, pos_hyst),
            last_output: None,
        })
    }

    pub fn points(&self) -> &[TablePoint] {
        &self.table
    }

    pub fn run(&mut self, measured: f64) -> Option<f64> {
        if let Some(last) = self.last_output {
            if self.hysteresis.holds(measured) {
                return Some(last);
            }
        }

        let output = lookup(&self.table, measured);
        self.hysteresis.compared = Some(measured);
        self.last_output = Some(output);
        Some(output)
    }
}

/// Which of the four tables produced the current output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveSelection {
    NormalRising,
    NormalFalling,
    OneFailRising,
    OneFailFalling,
}

impl CurveSelection {
    pub fn is_fan_fail(self) -> bool {
        matches!(self, Self::OneFailRising | Self::OneFailFalling)
    }
}

/// Four tables selected by direction of travel and fan health
///
/// While rising the output never goes below the previous output; while
/// falling it never goes above it.
#[derive(Debug, Clone)]
pub struct ThresholdTable4Curve {
    normal_up: Vec<TablePoint>,
    normal_down: Vec<TablePoint>,
    onefail_up: Vec<TablePoint>,
    onefail_down: Vec<TablePoint>,
    hysteresis: Hysteresis,
    last_output: Option<f64>,
    selected: Option<CurveSelection>,
}

impl ThresholdTable4Curve {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        normal_up: Vec<TablePoint>,
        normal_down: Vec<TablePoint>,
        onefail_up: Vec<TablePoint>,
        onefail_down: Vec<TablePoint>,
        neg_hyst: f64,
        pos_hyst: f64,
    ) -> Result<Self> {
        Ok(Self {
            normal_up: prepare_table(&format!("{}.normal_up", name), normal_up)?,
            normal_down: prepare_table(&format!("{}.normal_down", name), normal_down)?,
            onefail_up: prepare_table(&format!("{}.onefail_up", name), onefail_up)?,
            onefail_down: prepare_table(&format!("{}.onefail_down", name), onefail_down)?,
            hysteresis: Hysteresis::new(neg_hyst, pos_hyst),
            last_output: None,
            selected: None,
        })
    }

    /// Table used on the most recent recompute
    pub fn selected(&self) -> Option<CurveSelection> {
        self.selected
    }

    pub fn run(&mut self, measured: f64, dead_fan_count: u32) -> Option<f64> {
        let fan_fail = dead_fan_count > 0;
        let health_changed = self.selected.map_or(false, |s| s.is_fan_fail() != fan_fail);

        if let Some(last) = self.last_output {
            if !health_changed && self.hysteresis.holds(measured) {
                return Some(last);
            }
        }

        let rising = self.hysteresis.compared.map_or(true, |c| measured >= c);
        let (selection, table) = match (fan_fail, rising) {
            (false, true) => (CurveSelection::NormalRising, &self.normal_up),
            (false, false) => (CurveSelection::NormalFalling, &self.normal_down),
            (true, true) => (CurveSelection::OneFailRising, &self.onefail_up),
            (true, false) => (CurveSelection::OneFailFalling, &self.onefail_down),
        };

        let matched = lookup(table, measured);
        let output = match self.last_output {
            Some(prev) if rising => matched.max(prev),
            Some(prev) => matched.min(prev),
            None => matched,
        };

        self.hysteresis.compared = Some(measured);
        self.last_output = Some(output);
        self.selected = Some(selection);
        Some(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_table() -> Vec<TablePoint> {
        vec![(0.0, 30.0), (80.0, 100.0), (60.0, 70.0)]
    }

    #[test]
    fn test_table_is_sorted_and_looked_up() {
        let mut table = ThresholdTable::new("cpu", cpu_table(), 0.0, 0.0).unwrap();
        assert_eq!(table.points()[0], (80.0, 100.0));
        assert_eq!(table.run(85.0), Some(100.0));
        assert_eq!(table.run(65.0), Some(70.0));
        assert_eq!(table.run(10.0), Some(30.0));
    }

    #[test]
    fn test_below_lowest_threshold_uses_lowest_row() {
        let mut table = ThresholdTable::new("cpu", vec![(40.0, 20.0), (60.0, 50.0)], 0.0, 0.0).unwrap();
        assert_eq!(table.run(-5.0), Some(20.0));
    }

    #[test]
    fn test_hysteresis_holds_small_moves() {
        let mut table = ThresholdTable::new("cpu", cpu_table(), 2.0, 2.0).unwrap();
        assert_eq!(table.run(70.0), Some(70.0));
        assert_eq!(table.run(71.0), Some(70.0));
        assert_eq!(table.run(69.0), Some(70.0));
        // Leaving the band recomputes
        assert_eq!(table.run(81.0), Some(100.0));
    }

    #[test]
    fn test_hysteresis_band_does_not_follow_drift() {
        let mut table = ThresholdTable::new("cpu", vec![(60.0, 70.0), (59.0, 40.0)], 2.0, 2.0).unwrap();
        assert_eq!(table.run(60.0), Some(70.0));
        assert_eq!(table.run(59.0), Some(70.0));
        assert_eq!(table.run(58.5), Some(70.0));
        // 57.5 is outside [58, 62] even though it is close to the last sample
        assert_eq!(table.run(57.5), Some(40.0));
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(ThresholdTable::new("cpu", vec![], 0.0, 0.0).is_err());
        assert!(ThresholdTable::new("cpu", vec![(f64::NAN, 1.0)], 0.0, 0.0).is_err());
    }

    fn four_curve() -> ThresholdTable4Curve {
        ThresholdTable4Curve::new(
            "inlet",
            vec![(30.0, 40.0), (20.0, 20.0)],
            vec![(28.0, 40.0), (18.0, 20.0)],
            vec![(30.0, 60.0), (20.0, 45.0)],
            vec![(28.0, 60.0), (18.0, 45.0)],
            0.0,
            0.0,
        )
        .unwrap()
    }

    #[test]
    fn test_four_curve_is_monotone_in_direction_of_travel() {
        let mut curve = four_curve();
        let rising: Vec<f64> = [18.0, 22.0, 26.0, 31.0, 33.0]
            .iter()
            .map(|v| curve.run(*v, 0).unwrap())
            .collect();
        assert!(rising.windows(2).all(|w| w[1] >= w[0]), "{:?}", rising);
        assert_eq!(curve.selected(), Some(CurveSelection::NormalRising));

        let falling: Vec<f64> = [30.0, 27.0, 22.0, 17.0]
            .iter()
            .map(|v| curve.run(*v, 0).unwrap())
            .collect();
        assert!(falling.windows(2).all(|w| w[1] <= w[0]), "{:?}", falling);
        assert_eq!(curve.selected(), Some(CurveSelection::NormalFalling));
    }

    #[test]
    fn test_four_curve_switches_to_fan_fail_tables() {
        let mut curve = four_curve();
        assert_eq!(curve.run(25.0, 0), Some(20.0));
        assert_eq!(curve.run(25.0, 1), Some(45.0));
        assert!(curve.selected().unwrap().is_fan_fail());
    }

    #[test]
    fn test_four_curve_fan_fail_overrides_hysteresis() {
        let mut curve = ThresholdTable4Curve::new(
            "inlet",
            vec![(20.0, 20.0)],
            vec![(20.0, 20.0)],
            vec![(20.0, 50.0)],
            vec![(20.0, 50.0)],
            3.0,
            3.0,
        )
        .unwrap();
        assert_eq!(curve.run(25.0, 0), Some(20.0));
        assert_eq!(curve.run(25.5, 2), Some(50.0));
        assert_eq!(curve.selected(), Some(CurveSelection::OneFailRising));
    }
}
