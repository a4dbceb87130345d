//! Weekly and monthly rollups over frozen daily buckets.
//!
//! Counts and usage are summed and AHI is recomputed from the sums. Every
//! other metric is a usage-weighted mean of the nightly values, skipping
//! nights where the metric is undefined.

use super::daily::DailyBucket;
use crate::session::EventKind;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendPeriod {
    /// ISO week, Monday start
    Week,
    Month,
}

impl TrendPeriod {
    /// First day of the period containing `date`.
    pub fn period_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            TrendPeriod::Week => {
                date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
            }
            TrendPeriod::Month => date.with_day(1).unwrap_or(date),
        }
    }

    /// First day after the period starting at `start`.
    pub fn period_end(self, start: NaiveDate) -> NaiveDate {
        match self {
            TrendPeriod::Week => start + Duration::days(7),
            TrendPeriod::Month => {
                let (year, month) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(start + Duration::days(31))
            }
        }
    }

    /// Human label, e.g. `2024-W09` or `2024-03`.
    pub fn label(self, start: NaiveDate) -> String {
        match self {
            TrendPeriod::Week => {
                let week = start.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            TrendPeriod::Month => format!("{}-{:02}", start.year(), start.month()),
        }
    }
}

/// Usage-weighted means of nightly values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendMetrics {
    pub pressure_median: Option<f64>,
    pub pressure_p95: Option<f64>,
    pub exhale_pressure_median: Option<f64>,
    pub leak_median: Option<f64>,
    pub leak_p95: Option<f64>,
    pub unintentional_leak_median: Option<f64>,
    pub leak_over_threshold_fraction: Option<f64>,
    pub flex_duty_cycle: Option<f64>,
    pub tidal_volume_median: Option<f64>,
    pub respiratory_rate_median: Option<f64>,
    pub minute_ventilation_median: Option<f64>,
    pub flow_limitation_median: Option<f64>,
    pub peak_rolling_ahi: Option<f64>,
}

/// Rollup of the nights falling in one week or month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendBucket {
    pub period: TrendPeriod,
    pub label: String,
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
    #[serde(skip)]
    pub days: Vec<Arc<DailyBucket>>,
    pub nights: usize,
    /// Nights with any usage
    pub nights_used: usize,
    pub usage_secs: f64,
    pub event_counts: BTreeMap<EventKind, u32>,
    pub ahi_event_count: u32,
    pub ahi: Option<f64>,
    pub metrics: TrendMetrics,
}

impl TrendBucket {
    pub fn average_usage_hours(&self) -> Option<f64> {
        (self.nights > 0).then(|| self.usage_secs / 3600.0 / self.nights as f64)
    }
}

fn weighted_mean(
    days: &[Arc<DailyBucket>],
    value: impl Fn(&DailyBucket) -> Option<f64>,
) -> Option<f64> {
    let (sum, weight) = days
        .iter()
        .filter(|d| d.usage_secs > 0.0)
        .filter_map(|d| value(d).filter(|v| v.is_finite()).map(|v| (v, d.usage_secs)))
        .fold((0.0, 0.0), |(sum, weight), (v, w)| (sum + v * w, weight + w));
    (weight > 0.0).then(|| sum / weight)
}

fn rollup(period: TrendPeriod, start: NaiveDate, days: Vec<Arc<DailyBucket>>) -> TrendBucket {
    let usage_secs: f64 = days.iter().map(|d| d.usage_secs).sum();
    let mut event_counts: BTreeMap<EventKind, u32> = BTreeMap::new();
    for day in &days {
        for (kind, n) in &day.event_counts {
            *event_counts.entry(*kind).or_insert(0) += n;
        }
    }
    let ahi_event_count: u32 = days.iter().map(|d| d.ahi_event_count).sum();
    let ahi = (usage_secs > 0.0).then(|| ahi_event_count as f64 / (usage_secs / 3600.0));

    let metrics = TrendMetrics {
        pressure_median: weighted_mean(&days, |d| d.pressure.pressure.map(|s| s.median)),
        pressure_p95: weighted_mean(&days, |d| d.pressure.pressure.map(|s| s.p95)),
        exhale_pressure_median: weighted_mean(&days, |d| {
            d.pressure.exhale_pressure.map(|s| s.median)
        }),
        leak_median: weighted_mean(&days, |d| d.leak.total.map(|s| s.median)),
        leak_p95: weighted_mean(&days, |d| d.leak.total.map(|s| s.p95)),
        unintentional_leak_median: weighted_mean(&days, |d| {
            d.leak.unintentional.map(|s| s.median)
        }),
        leak_over_threshold_fraction: weighted_mean(&days, |d| d.leak.over_threshold_fraction),
        flex_duty_cycle: weighted_mean(&days, |d| d.flex_duty_cycle),
        tidal_volume_median: weighted_mean(&days, |d| {
            d.breaths.as_ref().map(|b| b.tidal_volume_ml.median)
        }),
        respiratory_rate_median: weighted_mean(&days, |d| {
            d.breaths.as_ref().map(|b| b.respiratory_rate.median)
        }),
        minute_ventilation_median: weighted_mean(&days, |d| {
            d.breaths.as_ref().map(|b| b.minute_ventilation.median)
        }),
        flow_limitation_median: weighted_mean(&days, |d| d.flow_limitation.breath_median),
        peak_rolling_ahi: weighted_mean(&days, |d| d.peak_rolling_ahi),
    };

    TrendBucket {
        period,
        label: period.label(start),
        start,
        end: period.period_end(start),
        nights: days.len(),
        nights_used: days.iter().filter(|d| d.usage_secs > 0.0).count(),
        usage_secs,
        event_counts,
        ahi_event_count,
        ahi,
        metrics,
        days,
    }
}

/// Group nights by `period`, ordered by period start.
pub fn rollup_trends(days: &[Arc<DailyBucket>], period: TrendPeriod) -> Vec<TrendBucket> {
    let mut groups: BTreeMap<NaiveDate, Vec<Arc<DailyBucket>>> = BTreeMap::new();
    for day in days {
        groups
            .entry(period.period_start(day.date))
            .or_default()
            .push(Arc::clone(day));
    }

    groups
        .into_iter()
        .map(|(start, mut members)| {
            members.sort_by_key(|d| d.date);
            rollup(period, start, members)
        })
        .collect()
}

pub fn weekly(days: &[Arc<DailyBucket>]) -> Vec<TrendBucket> {
    rollup_trends(days, TrendPeriod::Week)
}

pub fn monthly(days: &[Arc<DailyBucket>]) -> Vec<TrendBucket> {
    rollup_trends(days, TrendPeriod::Month)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::daily::aggregate_days;
    use crate::config::AggregatorConfig;
    use crate::session::{Event, Session, SignalSample, SignalType};
    use chrono::{TimeZone, Utc};

    fn night(day: u32, hours: i64, apneas: usize, pressure: f64) -> Session {
        let start = Utc.with_ymd_and_hms(2024, 2, day, 22, 0, 0).unwrap();
        let mut s = Session::new(day, start, format!("{day:08X}.001"));
        s.end = start + Duration::hours(hours);
        for k in 0..apneas {
            s.events.push(Event::new(
                start + Duration::minutes(10 + k as i64),
                EventKind::ObstructiveApnea,
                None,
            ));
        }
        s.signals
            .push(SignalSample::new(start, pressure, SignalType::Pressure));
        s
    }

    #[test]
    fn test_period_boundaries() {
        // 2024-02-29 is a Thursday.
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let monday = TrendPeriod::Week.period_start(date);
        assert_eq!(monday, NaiveDate::from_ymd_opt(2024, 2, 26).unwrap());
        assert_eq!(TrendPeriod::Week.label(monday), "2024-W09");

        let first = TrendPeriod::Month.period_start(date);
        assert_eq!(
            TrendPeriod::Month.period_end(first),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        let december = NaiveDate::from_ymd_opt(2023, 12, 1).unwrap();
        assert_eq!(
            TrendPeriod::Month.period_end(december),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
        );
    }

    #[test]
    fn test_ahi_recomputed_from_sums() {
        // 1 hour with 10 events and 9 hours with none: mean of nightly AHI
        // would be 5.0, the pooled figure is 1.0.
        let sessions = vec![night(26, 1, 10, 8.0), night(27, 9, 0, 12.0)];
        let days = aggregate_days(&sessions, &AggregatorConfig::default());
        let weeks = weekly(&days);

        assert_eq!(weeks.len(), 1);
        let week = &weeks[0];
        assert_eq!(week.nights, 2);
        assert_eq!(week.nights_used, 2);
        assert_eq!(week.ahi_event_count, 10);
        assert!((week.ahi.unwrap() - 1.0).abs() < 1e-9);
        assert!((week.metrics.pressure_median.unwrap() - 11.6).abs() < 1e-9);
        assert_eq!(week.metrics.tidal_volume_median, None);
    }

    #[test]
    fn test_weeks_and_months_split() {
        let sessions = vec![night(25, 8, 0, 10.0), night(26, 8, 0, 10.0), night(29, 8, 0, 10.0)];
        let days = aggregate_days(&sessions, &AggregatorConfig::default());

        let weeks = weekly(&days);
        assert_eq!(weeks.len(), 2);
        assert_eq!(weeks[0].nights, 1);
        assert_eq!(weeks[1].nights, 2);

        let months = monthly(&days);
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].label, "2024-02");
        assert!((months[0].usage_secs - 24.0 * 3600.0).abs() < 1e-6);
    }

    #[test]
    fn test_unused_nights_have_no_ahi() {
        let sessions = vec![night(26, 0, 0, 10.0)];
        let days = aggregate_days(&sessions, &AggregatorConfig::default());
        let weeks = weekly(&days);
        assert_eq!(weeks[0].nights_used, 0);
        assert_eq!(weeks[0].ahi, None);
        assert_eq!(weeks[0].metrics.pressure_median, None);
    }
}
