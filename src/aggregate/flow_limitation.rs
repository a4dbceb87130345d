//! Minute-resolution flow-limitation series and severity bands.

use super::timeline::MinuteGrid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median};

/// Scores below this are `Low`.
pub const MEDIUM_THRESHOLD: f64 = 0.1;
/// Scores at or above this are `High`.
pub const HIGH_THRESHOLD: f64 = 0.3;

/// Three-level flow-limitation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn classify(score: f64) -> Self {
        if score >= HIGH_THRESHOLD {
            Severity::High
        } else if score >= MEDIUM_THRESHOLD {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Median breath score of each minute; `None` for minutes without breaths.
pub fn minute_medians(grid: &MinuteGrid, scores: &[(DateTime<Utc>, f64)]) -> Vec<Option<f64>> {
    let mut per_minute: Vec<Vec<f64>> = vec![Vec::new(); grid.len()];
    for &(t, score) in scores {
        if let Some(i) = grid.index_of(t) {
            per_minute[i].push(score);
        }
    }

    per_minute
        .into_iter()
        .map(|values| (!values.is_empty()).then(|| Data::new(values).median()))
        .collect()
}

/// Exponential moving average with a half-life given in minutes.
///
/// Minutes without input produce `None`. The running state survives short
/// gaps but is reset once a gap outlasts the half-life.
pub fn ema(series: &[Option<f64>], half_life_minutes: f64) -> Vec<Option<f64>> {
    let alpha = 1.0 - 0.5f64.powf(1.0 / half_life_minutes.max(f64::MIN_POSITIVE));
    let mut state: Option<f64> = None;
    let mut missing = 0usize;

    series
        .iter()
        .map(|value| match value {
            Some(x) => {
                if missing as f64 > half_life_minutes {
                    state = None;
                }
                missing = 0;
                let next = match state {
                    Some(s) => s + alpha * (x - s),
                    None => *x,
                };
                state = Some(next);
                Some(next)
            }
            None => {
                missing += 1;
                None
            }
        })
        .collect()
}

pub fn classify_series(series: &[Option<f64>]) -> Vec<Option<Severity>> {
    series.iter().map(|v| v.map(Severity::classify)).collect()
}

/// Per-minute flow limitation over a bucket window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLimitationSeries {
    pub minute_median: Vec<Option<f64>>,
    pub ema_5m: Vec<Option<f64>>,
    pub ema_15m: Vec<Option<f64>>,
    pub severity_5m: Vec<Option<Severity>>,
    pub severity_15m: Vec<Option<Severity>>,
}

impl FlowLimitationSeries {
    pub fn build(grid: &MinuteGrid, scores: &[(DateTime<Utc>, f64)]) -> Self {
        let minute_median = minute_medians(grid, scores);
        let ema_5m = ema(&minute_median, 5.0);
        let ema_15m = ema(&minute_median, 15.0);
        Self {
            severity_5m: classify_series(&ema_5m),
            severity_15m: classify_series(&ema_15m),
            minute_median,
            ema_5m,
            ema_15m,
        }
    }

    /// Minutes spent in `band` on the 5-minute smoothed series.
    pub fn minutes_in(&self, band: Severity) -> usize {
        self.severity_5m.iter().filter(|s| **s == Some(band)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_band_edges() {
        assert_eq!(Severity::classify(0.0), Severity::Low);
        assert_eq!(Severity::classify(0.099), Severity::Low);
        assert_eq!(Severity::classify(0.1), Severity::Medium);
        assert_eq!(Severity::classify(0.3), Severity::High);
        assert_eq!(Severity::classify(1.0), Severity::High);
    }

    #[test]
    fn test_minute_medians() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let grid = MinuteGrid::new(origin, origin + Duration::minutes(3));
        let at = |s: i64| origin + Duration::seconds(s);
        let scores = vec![(at(5), 0.1), (at(20), 0.5), (at(40), 0.2), (at(150), 0.9)];

        let medians = minute_medians(&grid, &scores);
        assert_eq!(medians.len(), 3);
        assert!((medians[0].unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(medians[1], None);
        assert!((medians[2].unwrap() - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_ema_half_life() {
        let mut series = vec![Some(0.0)];
        series.extend(std::iter::repeat(Some(1.0)).take(5));
        let smoothed = ema(&series, 5.0);
        // After one half-life of unit input the average covers half the step.
        assert!((smoothed[5].unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_ema_gaps() {
        let series = vec![Some(1.0), None, Some(0.0)];
        let smoothed = ema(&series, 5.0);
        assert_eq!(smoothed[1], None);
        // Short gap keeps the state.
        assert!(smoothed[2].unwrap() > 0.0);

        let mut long_gap = vec![Some(1.0)];
        long_gap.extend(std::iter::repeat(None).take(6));
        long_gap.push(Some(0.0));
        assert_eq!(ema(&long_gap, 5.0)[7], Some(0.0));
    }

    #[test]
    fn test_series_counts_high_minutes() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let grid = MinuteGrid::new(origin, origin + Duration::minutes(10));
        let scores: Vec<_> = (0..10)
            .map(|m| (origin + Duration::minutes(m), 0.6))
            .collect();

        let series = FlowLimitationSeries::build(&grid, &scores);
        assert_eq!(series.minutes_in(Severity::High), 10);
        assert_eq!(series.minutes_in(Severity::Low), 0);
    }
}
