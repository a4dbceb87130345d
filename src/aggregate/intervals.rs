//! Duration-weighted views of irregularly sampled channels.
//!
//! A sample is taken to hold its value until the next sample of the same
//! channel, so statistics are weighted by how long each value was in effect
//! rather than by how often the device happened to report it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A value held for a span of time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedInterval {
    pub start: DateTime<Utc>,
    pub duration_secs: f64,
    pub value: f64,
}

impl WeightedInterval {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::milliseconds((self.duration_secs * 1000.0).round() as i64)
    }
}

fn secs_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_milliseconds() as f64 / 1000.0
}

/// Turn time-ordered samples into weighted intervals inside one slice.
///
/// Each sample runs until the next one, never shorter than
/// `min_segment_secs` and never past `slice_end`. The last sample runs to
/// the slice end. Samples outside `[slice_start, slice_end)` are ignored.
/// Samples sharing a timestamp each receive the noise-floor weight.
pub fn build_intervals(
    samples: &[(DateTime<Utc>, f64)],
    slice_start: DateTime<Utc>,
    slice_end: DateTime<Utc>,
    min_segment_secs: f64,
) -> Vec<WeightedInterval> {
    let inside: Vec<(DateTime<Utc>, f64)> = samples
        .iter()
        .copied()
        .filter(|(t, v)| *t >= slice_start && *t < slice_end && v.is_finite())
        .collect();

    let min_segment = min_segment_secs.max(0.0);
    let mut intervals = Vec::with_capacity(inside.len());

    for (i, &(t, value)) in inside.iter().enumerate() {
        let next = inside.get(i + 1).map(|(n, _)| *n).unwrap_or(slice_end);
        let available = secs_between(t, slice_end);
        let duration = secs_between(t, next).max(min_segment).min(available);
        if duration > 0.0 {
            intervals.push(WeightedInterval {
                start: t,
                duration_secs: duration,
                value,
            });
        }
    }

    intervals
}

/// Values with weights, sorted once for repeated queries.
#[derive(Debug, Clone, Default)]
pub struct WeightedSeries {
    points: Vec<(f64, f64)>,
    total: f64,
}

impl WeightedSeries {
    /// Build from `(value, weight)` pairs. Non-finite values and negative
    /// weights are discarded.
    pub fn new(pairs: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut points: Vec<(f64, f64)> = pairs
            .into_iter()
            .filter(|(v, w)| v.is_finite() && w.is_finite() && *w >= 0.0)
            .collect();
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let total = points.iter().map(|(_, w)| w).sum();
        Self { points, total }
    }

    pub fn from_intervals(intervals: &[WeightedInterval]) -> Self {
        Self::new(intervals.iter().map(|i| (i.value, i.duration_secs)))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.total
    }

    pub fn min(&self) -> Option<f64> {
        self.points.first().map(|(v, _)| *v)
    }

    pub fn max(&self) -> Option<f64> {
        self.points.last().map(|(v, _)| *v)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.total <= 0.0 {
            return None;
        }
        Some(self.points.iter().map(|(v, w)| v * w).sum::<f64>() / self.total)
    }

    /// Weighted quantile with linear interpolation between weight centres.
    ///
    /// `q` is clamped to `[0, 1]`; 0 yields the smallest weighted value and
    /// 1 the largest. Non-decreasing in `q`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.total <= 0.0 {
            return None;
        }
        let target = q.clamp(0.0, 1.0) * self.total;

        let mut cumulative = 0.0;
        let mut previous: Option<(f64, f64)> = None;
        for &(value, weight) in self.points.iter().filter(|(_, w)| *w > 0.0) {
            let centre = cumulative + weight / 2.0;
            if target <= centre {
                return Some(match previous {
                    None => value,
                    Some((prev_centre, prev_value)) => {
                        let t = (target - prev_centre) / (centre - prev_centre);
                        prev_value + (value - prev_value) * t
                    }
                });
            }
            previous = Some((centre, value));
            cumulative += weight;
        }

        previous.map(|(_, v)| v)
    }

    pub fn median(&self) -> Option<f64> {
        self.quantile(0.5)
    }

    /// Share of the total weight whose value is strictly above `threshold`.
    pub fn fraction_over(&self, threshold: f64) -> Option<f64> {
        if self.total <= 0.0 {
            return None;
        }
        let over: f64 = self
            .points
            .iter()
            .filter(|(v, _)| *v > threshold)
            .map(|(_, w)| w)
            .sum();
        Some((over / self.total).clamp(0.0, 1.0))
    }
}

/// Summary of one channel over a night.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    /// Seconds covered by the channel's intervals
    pub covered_secs: f64,
}

impl ChannelStats {
    pub fn from_series(series: &WeightedSeries) -> Option<Self> {
        Some(Self {
            min: series.min()?,
            max: series.max()?,
            mean: series.mean()?,
            median: series.median()?,
            p95: series.quantile(0.95)?,
            covered_secs: series.total_weight(),
        })
    }

    pub fn from_intervals(intervals: &[WeightedInterval]) -> Option<Self> {
        Self::from_series(&WeightedSeries::from_intervals(intervals))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 22, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    #[test]
    fn test_intervals_hold_until_next_sample() {
        let samples = vec![(at(0), 10.0), (at(60), 12.0), (at(90), 8.0)];
        let intervals = build_intervals(&samples, at(0), at(120), 1.0);

        let durations: Vec<f64> = intervals.iter().map(|i| i.duration_secs).collect();
        assert_eq!(durations, vec![60.0, 30.0, 30.0]);
        assert_eq!(intervals[2].end(), at(120));
    }

    #[test]
    fn test_intervals_respect_slice_and_noise_floor() {
        let samples = vec![
            (at(-10), 99.0),
            (at(0), 1.0),
            (at(0), 2.0),
            (at(100), 3.0),
            (at(130), 4.0),
        ];
        let intervals = build_intervals(&samples, at(0), at(120), 1.0);

        assert_eq!(intervals.len(), 3);
        // Duplicate timestamp gets the noise floor.
        assert_eq!(intervals[0].duration_secs, 1.0);
        assert_eq!(intervals[1].duration_secs, 100.0);
        // Last sample truncated to the slice end.
        assert_eq!(intervals[2].duration_secs, 20.0);
        assert!(intervals.iter().all(|i| i.value < 99.0));
    }

    #[test]
    fn test_noise_floor_never_passes_slice_end() {
        let samples = vec![(at(0), 1.0), (at(119) + Duration::milliseconds(500), 2.0)];
        let intervals = build_intervals(&samples, at(0), at(120), 1.0);
        assert_eq!(intervals[1].duration_secs, 0.5);
    }

    #[test]
    fn test_quantile_endpoints_and_weighting() {
        let series = WeightedSeries::new(vec![(10.0, 1.0), (20.0, 3.0)]);

        assert_eq!(series.quantile(0.0), Some(10.0));
        assert_eq!(series.quantile(1.0), Some(20.0));
        // Centres at 0.5 and 2.5 of 4.0; median target 2.0 interpolates 3/4 of the way.
        assert!((series.median().unwrap() - 17.5).abs() < 1e-9);
        assert!((series.mean().unwrap() - 17.5).abs() < 1e-9);
    }

    #[test]
    fn test_quantile_is_monotonic() {
        let series = WeightedSeries::new(vec![
            (5.0, 2.0),
            (1.0, 0.5),
            (9.0, 7.0),
            (3.0, 1.0),
            (9.0, 0.0),
            (-2.0, 4.0),
        ]);
        let mut last = f64::NEG_INFINITY;
        for step in 0..=100 {
            let q = series.quantile(step as f64 / 100.0).unwrap();
            assert!(q >= last, "quantile decreased at step {step}");
            last = q;
        }
    }

    #[test]
    fn test_min_max_ignore_weight() {
        let series = WeightedSeries::new(vec![(4.0, 0.0), (6.0, 10.0), (30.0, 0.0)]);
        assert_eq!(series.min(), Some(4.0));
        assert_eq!(series.max(), Some(30.0));
        assert_eq!(series.median(), Some(6.0));
    }

    #[test]
    fn test_fraction_over_bounds() {
        let series = WeightedSeries::new(vec![(10.0, 30.0), (30.0, 10.0)]);
        assert_eq!(series.fraction_over(24.0), Some(0.25));
        assert_eq!(series.fraction_over(100.0), Some(0.0));
        assert_eq!(series.fraction_over(-1.0), Some(1.0));
        assert_eq!(WeightedSeries::default().fraction_over(1.0), None);
    }

    #[test]
    fn test_empty_series_has_no_stats() {
        assert!(ChannelStats::from_intervals(&[]).is_none());
        assert_eq!(WeightedSeries::default().quantile(0.5), None);
    }
}
