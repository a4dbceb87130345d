//! Pressure-dependent intentional-leak model.
//!
//! Masks vent more air at higher pressure. The expected (intentional) leak is
//! estimated per pressure bin as a low percentile of observed leak, then a
//! straight line is fitted through the bin baselines. Whatever leak exceeds
//! that line is reported as unintentional.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};
use std::collections::BTreeMap;

/// Width of a pressure bin (cmH2O).
pub const PRESSURE_BIN_WIDTH: f64 = 1.0;

/// Bins with fewer pairs than this do not contribute a baseline.
pub const MIN_BIN_SAMPLES: usize = 3;

/// Percentile of leak taken as a bin's intentional baseline.
pub const BASELINE_PERCENTILE: usize = 20;

/// Linear intentional-leak model: `intercept + slope * pressure`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakModel {
    pub intercept: f64,
    pub slope: f64,
    /// Pressure bins the fit was made from
    pub bins_used: usize,
}

impl LeakModel {
    /// Expected intentional leak at `pressure`, never negative.
    pub fn expected(&self, pressure: f64) -> f64 {
        (self.intercept + self.slope * pressure).max(0.0)
    }

    /// Leak above the model, never negative.
    pub fn unintentional(&self, pressure: f64, leak: f64) -> f64 {
        (leak - self.expected(pressure)).max(0.0)
    }
}

/// Attach the pressure in effect to each leak sample.
///
/// The pressure in effect is the latest pressure sample at or before the leak
/// sample. Leak samples preceding every pressure sample are dropped. Both
/// inputs must be sorted by time.
pub fn pair_with_pressure(
    leak: &[(DateTime<Utc>, f64)],
    pressure: &[(DateTime<Utc>, f64)],
) -> Vec<(DateTime<Utc>, f64, f64)> {
    leak.iter()
        .filter_map(|&(t, l)| {
            let idx = pressure.partition_point(|(pt, _)| *pt <= t);
            idx.checked_sub(1).map(|i| (t, pressure[i].1, l))
        })
        .collect()
}

/// Fit the model from `(pressure, leak)` pairs.
///
/// Returns `None` when no bin has enough samples. A single usable bin gives a
/// flat model.
pub fn fit_leak_model(pairs: &[(f64, f64)]) -> Option<LeakModel> {
    let mut bins: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for &(pressure, leak) in pairs {
        if pressure.is_finite() && leak.is_finite() {
            let key = (pressure / PRESSURE_BIN_WIDTH).floor() as i64;
            bins.entry(key).or_default().push(leak);
        }
    }

    let points: Vec<(f64, f64)> = bins
        .into_iter()
        .filter(|(_, leaks)| leaks.len() >= MIN_BIN_SAMPLES)
        .map(|(key, leaks)| {
            let centre = (key as f64 + 0.5) * PRESSURE_BIN_WIDTH;
            let mut data = Data::new(leaks);
            (centre, data.percentile(BASELINE_PERCENTILE))
        })
        .collect();

    if points.is_empty() {
        return None;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = points
        .iter()
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    Some(LeakModel {
        intercept: mean_y - slope * mean_x,
        slope,
        bins_used: points.len(),
    })
}
