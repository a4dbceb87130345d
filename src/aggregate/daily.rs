//! Nightly aggregation: merged sessions in, frozen daily buckets out.
//!
//! A run goes through four stages: collect each night's session slices,
//! clamp events and samples to those slices, compute the derived statistics,
//! and freeze the result into an immutable [`DailyBucket`]. Nothing built in
//! the middle of a run is visible outside this module.

use super::episodes::{
    cluster_instants, correlate, high_flow_limitation_episodes, leak_episodes, Episode,
    EpisodeCorrelation, EpisodeKind,
};
use super::flow_limitation::{FlowLimitationSeries, Severity};
use super::intervals::{build_intervals, ChannelStats, WeightedInterval, WeightedSeries};
use super::leak::{fit_leak_model, pair_with_pressure, LeakModel};
use super::rolling::{rolling_ahi, RollingAhi};
use super::timeline::{local_date, local_day_bounds, MinuteGrid};
use crate::breath::segment_breaths;
use crate::config::AggregatorConfig;
use crate::session::{Breath, Event, EventKind, Session, SignalSample, SignalType};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Window of the rolling AHI whose peak is reported with the nightly figures.
pub const PEAK_ROLLING_WINDOW_MIN: u32 = 30;

/// The part of one session counted towards a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSlice {
    pub session_id: u32,
    pub source: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SessionSlice {
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds().max(0) as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub median: f64,
    pub p95: f64,
}

/// Duration-weighted breath statistics; present only all together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreathStats {
    pub breath_count: usize,
    pub tidal_volume_ml: MetricSummary,
    pub respiratory_rate: MetricSummary,
    pub minute_ventilation: MetricSummary,
    pub insp_time_secs: MetricSummary,
    pub exp_time_secs: MetricSummary,
    pub ie_ratio: MetricSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSummary {
    pub pressure: Option<ChannelStats>,
    pub exhale_pressure: Option<ChannelStats>,
    /// Minimum pressure recovered from the device settings
    pub device_min_pressure: Option<f64>,
    /// 5th percentile of exhale pressure above the device minimum
    pub calibration_offset: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakSummary {
    pub total: Option<ChannelStats>,
    /// Large-leak threshold applied to this night (L/min)
    pub threshold: f64,
    /// False when the configured fallback was used
    pub threshold_from_data: bool,
    pub over_threshold_fraction: Option<f64>,
    pub model: Option<LeakModel>,
    pub unintentional: Option<ChannelStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLimitationSummary {
    pub breath_median: Option<f64>,
    pub breath_p95: Option<f64>,
    /// Minute series over the bucket window; absent without scored breaths
    pub series: Option<FlowLimitationSeries>,
    pub high_minutes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub snore: Vec<Episode>,
    pub leak: Vec<Episode>,
    pub high_flow_limitation: Vec<Episode>,
    pub correlation: EpisodeCorrelation,
}

/// Everything computed for one local night. Never mutated once frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    /// Local midnight of `date`
    pub window_start: DateTime<Utc>,
    /// Next local midnight, or the last slice end if later
    pub window_end: DateTime<Utc>,
    pub slices: Vec<SessionSlice>,
    /// Sum of slice durations
    pub usage_secs: f64,
    pub events: Vec<Event>,
    pub signals: Vec<SignalSample>,
    pub event_counts: BTreeMap<EventKind, u32>,
    pub ahi_event_count: u32,
    /// Whole-night AHI; undefined without usage
    pub ahi: Option<f64>,
    pub peak_rolling_ahi: Option<f64>,
    pub rolling_ahi: Vec<RollingAhi>,
    pub usage_per_minute: Vec<f64>,
    pub pressure: PressureSummary,
    pub leak: LeakSummary,
    pub flex_duty_cycle: Option<f64>,
    pub breaths: Option<BreathStats>,
    pub flow_limitation: FlowLimitationSummary,
    pub episodes: EpisodeSummary,
    pub run_id: Uuid,
    pub computed_at: DateTime<Utc>,
}

impl DailyBucket {
    pub fn usage_hours(&self) -> f64 {
        self.usage_secs / 3600.0
    }

    pub fn count_of(&self, kind: EventKind) -> u32 {
        self.event_counts.get(&kind).copied().unwrap_or(0)
    }
}

/// Builds daily buckets from merged sessions.
pub struct DailyAggregator {
    config: AggregatorConfig,
}

impl DailyAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Aggregate `sessions` into one bucket per local night, ordered by date.
    ///
    /// Each session belongs to the night of its start instant, even when it
    /// runs past midnight.
    pub fn aggregate(&self, sessions: &[Session]) -> Vec<Arc<DailyBucket>> {
        let stamp = RunStamp {
            run_id: Uuid::new_v4(),
            computed_at: Utc::now(),
        };

        let mut nights: BTreeMap<NaiveDate, Vec<&Session>> = BTreeMap::new();
        for session in sessions {
            nights
                .entry(local_date(session.start, self.config.timezone))
                .or_default()
                .push(session);
        }

        let buckets: Vec<Arc<DailyBucket>> = nights
            .into_iter()
            .map(|(date, members)| {
                let night = Night::collect(date, members, &self.config);
                let clamped = night.clamp();
                let computed = clamped.compute(&self.config);
                Arc::new(computed.freeze(stamp))
            })
            .collect();

        info!(
            sessions = sessions.len(),
            days = buckets.len(),
            run_id = %stamp.run_id,
            "aggregated sessions into daily buckets"
        );
        buckets
    }
}

/// Aggregate with a one-off aggregator.
pub fn aggregate_days(sessions: &[Session], config: &AggregatorConfig) -> Vec<Arc<DailyBucket>> {
    DailyAggregator::new(config.clone()).aggregate(sessions)
}

#[derive(Debug, Clone, Copy)]
struct RunStamp {
    run_id: Uuid,
    computed_at: DateTime<Utc>,
}

/// Stage 1: a night's slices and their owning sessions.
struct Night<'a> {
    date: NaiveDate,
    window_end: DateTime<Utc>,
    grid: MinuteGrid,
    parts: Vec<(SessionSlice, &'a Session)>,
}

impl<'a> Night<'a> {
    fn collect(date: NaiveDate, members: Vec<&'a Session>, config: &AggregatorConfig) -> Self {
        let mut parts: Vec<(SessionSlice, &Session)> = members
            .into_iter()
            .map(|session| {
                let slice = SessionSlice {
                    session_id: session.session_id,
                    source: session.source.clone(),
                    start: session.start,
                    end: session.end.max(session.start),
                };
                (slice, session)
            })
            .collect();
        parts.sort_by(|a, b| (a.0.start, a.0.session_id).cmp(&(b.0.start, b.0.session_id)));

        let (day_start, day_end) = local_day_bounds(date, config.timezone);
        let window_end = parts
            .iter()
            .map(|(slice, _)| slice.end)
            .fold(day_end, DateTime::max);

        Self {
            date,
            window_end,
            grid: MinuteGrid::new(day_start, window_end),
            parts,
        }
    }

    fn clamp(self) -> Clamped<'a> {
        // Each session keeps only what falls inside its own slice.
        let mut events: Vec<Event> = self
            .parts
            .iter()
            .flat_map(|(slice, session)| {
                session
                    .events
                    .iter()
                    .filter(move |e| slice.contains(e.timestamp))
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.timestamp);

        let mut signals: Vec<SignalSample> = self
            .parts
            .iter()
            .flat_map(|(slice, session)| {
                session
                    .signals
                    .iter()
                    .filter(move |s| slice.contains(s.timestamp))
            })
            .copied()
            .collect();
        signals.sort_by_key(|s| (s.signal, s.timestamp));

        Clamped {
            night: self,
            events,
            signals,
        }
    }
}

/// Stage 2: events and samples retained for the night.
struct Clamped<'a> {
    night: Night<'a>,
    events: Vec<Event>,
    signals: Vec<SignalSample>,
}

/// Samples of `signal` from `session`, time-ordered with ties kept in order.
fn track(session: &Session, signal: SignalType) -> Vec<(DateTime<Utc>, f64)> {
    let mut samples: Vec<(DateTime<Utc>, f64)> = session
        .samples_of(signal)
        .map(|s| (s.timestamp, s.value))
        .collect();
    samples.sort_by_key(|(t, _)| *t);
    samples
}

fn metric(breaths: &[Breath], value: impl Fn(&Breath) -> f64) -> Option<MetricSummary> {
    let series = WeightedSeries::new(breaths.iter().map(|b| (value(b), b.duration_secs)));
    Some(MetricSummary {
        median: series.median()?,
        p95: series.quantile(0.95)?,
    })
}

fn breath_stats(breaths: &[Breath]) -> Option<BreathStats> {
    if breaths.is_empty() {
        return None;
    }
    Some(BreathStats {
        breath_count: breaths.len(),
        tidal_volume_ml: metric(breaths, |b| b.tidal_volume_ml)?,
        respiratory_rate: metric(breaths, |b| b.respiratory_rate)?,
        minute_ventilation: metric(breaths, |b| b.minute_ventilation)?,
        insp_time_secs: metric(breaths, |b| b.insp_time_secs)?,
        exp_time_secs: metric(breaths, |b| b.exp_time_secs)?,
        ie_ratio: metric(breaths, |b| b.ie_ratio)?,
    })
}

impl<'a> Clamped<'a> {
    fn intervals(&self, signal: SignalType, min_segment_secs: f64) -> Vec<WeightedInterval> {
        let mut intervals: Vec<WeightedInterval> = self
            .night
            .parts
            .iter()
            .flat_map(|(slice, session)| {
                build_intervals(&track(session, signal), slice.start, slice.end, min_segment_secs)
            })
            .collect();
        intervals.sort_by_key(|i| i.start);
        intervals
    }

    /// Breaths starting inside a slice, derived from the waveform when the
    /// session carries none.
    fn breaths(&self, config: &AggregatorConfig) -> Vec<Breath> {
        let mut breaths: Vec<Breath> = self
            .night
            .parts
            .iter()
            .flat_map(|(slice, session)| {
                let breaths = match (&session.breaths, &session.waveform) {
                    (Some(cached), _) => cached.clone(),
                    (None, Some(wave)) => segment_breaths(wave, &config.breath),
                    (None, None) => Vec::new(),
                };
                breaths.into_iter().filter(move |b| slice.contains(b.start))
            })
            .collect();
        breaths.sort_by_key(|b| b.start);
        breaths
    }

    fn pressure(&self, config: &AggregatorConfig) -> PressureSummary {
        let pressure = WeightedSeries::from_intervals(
            &self.intervals(SignalType::Pressure, config.min_sample_segment_secs),
        );
        let exhale = WeightedSeries::from_intervals(
            &self.intervals(SignalType::ExhalePressure, config.min_sample_segment_secs),
        );

        let device_min_pressure = self
            .night
            .parts
            .iter()
            .filter_map(|(_, session)| session.settings.map(|s| s.min_pressure))
            .reduce(f64::min);

        let baseline = if exhale.is_empty() { &pressure } else { &exhale };
        let calibration_offset = device_min_pressure
            .zip(baseline.quantile(0.05))
            .map(|(min, p05)| p05 - min);

        PressureSummary {
            pressure: ChannelStats::from_series(&pressure),
            exhale_pressure: ChannelStats::from_series(&exhale),
            device_min_pressure,
            calibration_offset,
        }
    }

    fn leak(&self, config: &AggregatorConfig, leak_intervals: &[WeightedInterval]) -> LeakSummary {
        let series = WeightedSeries::from_intervals(leak_intervals);
        let (threshold, threshold_from_data) = match series.mean() {
            Some(mean) => (mean, true),
            None => (config.leak_over_threshold, false),
        };

        // Leak paired with the pressure in effect, kept per slice so the
        // unintentional series can be rebuilt inside the same bounds.
        let paired: Vec<(&SessionSlice, Vec<(DateTime<Utc>, f64, f64)>)> = self
            .night
            .parts
            .iter()
            .map(|(slice, session)| {
                let leak: Vec<_> = track(session, SignalType::Leak)
                    .into_iter()
                    .filter(|(t, _)| slice.contains(*t))
                    .collect();
                let mut pressure = track(session, SignalType::Pressure);
                if pressure.is_empty() {
                    pressure = track(session, SignalType::ExhalePressure);
                }
                (slice, pair_with_pressure(&leak, &pressure))
            })
            .collect();

        let pairs: Vec<(f64, f64)> = paired
            .iter()
            .flat_map(|(_, triples)| triples.iter().map(|&(_, p, l)| (p, l)))
            .collect();
        let model = fit_leak_model(&pairs);

        let unintentional = model.and_then(|model| {
            let intervals: Vec<WeightedInterval> = paired
                .iter()
                .flat_map(|(slice, triples)| {
                    let excess: Vec<_> = triples
                        .iter()
                        .map(|&(t, p, l)| (t, model.unintentional(p, l)))
                        .collect();
                    build_intervals(&excess, slice.start, slice.end, config.min_sample_segment_secs)
                })
                .collect();
            ChannelStats::from_intervals(&intervals)
        });

        LeakSummary {
            total: ChannelStats::from_series(&series),
            threshold,
            threshold_from_data,
            over_threshold_fraction: series.fraction_over(threshold),
            model,
            unintentional,
        }
    }

    fn compute(self, config: &AggregatorConfig) -> Computed {
        let grid = self.night.grid;
        let min_segment = config.min_sample_segment_secs;
        let usage_secs: f64 = self.night.parts.iter().map(|(s, _)| s.duration_secs()).sum();

        let mut event_counts: BTreeMap<EventKind, u32> = BTreeMap::new();
        for event in &self.events {
            *event_counts.entry(event.kind).or_insert(0) += 1;
        }
        let ahi_event_count: u32 = event_counts
            .iter()
            .filter(|(kind, _)| kind.counts_for_ahi())
            .map(|(_, n)| n)
            .sum();
        let ahi = (usage_secs > 0.0).then(|| ahi_event_count as f64 / (usage_secs / 3600.0));

        // Rolling AHI inputs at minute resolution.
        let mut usage_per_minute = vec![0.0; grid.len()];
        for (slice, _) in &self.night.parts {
            grid.add_coverage(slice.start, slice.end, &mut usage_per_minute);
        }
        let mut events_per_minute = vec![0u32; grid.len()];
        for event in self.events.iter().filter(|e| e.kind.counts_for_ahi()) {
            if let Some(i) = grid.index_of(event.timestamp) {
                events_per_minute[i] += 1;
            }
        }
        let rolling: Vec<RollingAhi> = config
            .rolling_ahi_windows_min
            .iter()
            .map(|&w| rolling_ahi(&usage_per_minute, &events_per_minute, w))
            .collect();
        let peak_rolling_ahi = match rolling
            .iter()
            .find(|r| r.window_minutes == PEAK_ROLLING_WINDOW_MIN)
        {
            Some(series) => series.peak(),
            None => {
                rolling_ahi(&usage_per_minute, &events_per_minute, PEAK_ROLLING_WINDOW_MIN).peak()
            }
        };

        let pressure = self.pressure(config);
        let leak_intervals = self.intervals(SignalType::Leak, min_segment);
        let leak = self.leak(config, &leak_intervals);
        let flex_duty_cycle =
            WeightedSeries::from_intervals(&self.intervals(SignalType::FlexActive, min_segment))
                .fraction_over(0.5);

        let breaths = self.breaths(config);
        let breath_summary = breath_stats(&breaths);

        let scored: Vec<&Breath> = breaths.iter().filter(|b| b.flow_limitation.is_some()).collect();
        let fl_weights = WeightedSeries::new(
            scored
                .iter()
                .filter_map(|b| b.flow_limitation.map(|s| (s, b.duration_secs))),
        );
        let fl_scores: Vec<(DateTime<Utc>, f64)> = scored
            .iter()
            .filter_map(|b| b.flow_limitation.map(|s| (b.start, s)))
            .collect();
        let fl_series =
            (!fl_scores.is_empty()).then(|| FlowLimitationSeries::build(&grid, &fl_scores));

        let snore_times: Vec<DateTime<Utc>> = self
            .events
            .iter()
            .filter(|e| e.kind.is_snore())
            .map(|e| e.timestamp)
            .collect();
        let snore = cluster_instants(
            EpisodeKind::Snore,
            &snore_times,
            config.snore_episode_gap_secs,
        );
        let leak_eps = leak_episodes(
            &leak_intervals,
            leak.threshold,
            config.leak_episode_min_secs,
            config.leak_episode_gap_secs,
        );
        let high_fl = fl_series
            .as_ref()
            .map(|s| high_flow_limitation_episodes(&grid, &s.severity_5m))
            .unwrap_or_default();
        let correlation = correlate(&snore, &leak_eps, &high_fl);

        let flow_limitation = FlowLimitationSummary {
            breath_median: fl_weights.median(),
            breath_p95: fl_weights.quantile(0.95),
            high_minutes: fl_series
                .as_ref()
                .map(|s| s.minutes_in(Severity::High))
                .unwrap_or(0),
            series: fl_series,
        };

        Computed {
            date: self.night.date,
            window_start: grid.origin,
            window_end: self.night.window_end,
            slices: self.night.parts.iter().map(|(s, _)| s.clone()).collect(),
            usage_secs,
            events: self.events,
            signals: self.signals,
            event_counts,
            ahi_event_count,
            ahi,
            peak_rolling_ahi,
            rolling_ahi: rolling,
            usage_per_minute,
            pressure,
            leak,
            flex_duty_cycle,
            breaths: breath_summary,
            flow_limitation,
            episodes: EpisodeSummary {
                snore,
                leak: leak_eps,
                high_flow_limitation: high_fl,
                correlation,
            },
        }
    }
}

/// Stage 3: all statistics, not yet stamped with a run.
struct Computed {
    date: NaiveDate,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    slices: Vec<SessionSlice>,
    usage_secs: f64,
    events: Vec<Event>,
    signals: Vec<SignalSample>,
    event_counts: BTreeMap<EventKind, u32>,
    ahi_event_count: u32,
    ahi: Option<f64>,
    peak_rolling_ahi: Option<f64>,
    rolling_ahi: Vec<RollingAhi>,
    usage_per_minute: Vec<f64>,
    pressure: PressureSummary,
    leak: LeakSummary,
    flex_duty_cycle: Option<f64>,
    breaths: Option<BreathStats>,
    flow_limitation: FlowLimitationSummary,
    episodes: EpisodeSummary,
}

impl Computed {
    fn freeze(self, stamp: RunStamp) -> DailyBucket {
        let sliced_secs: f64 = self.slices.iter().map(SessionSlice::duration_secs).sum();
        debug_assert!((self.usage_secs - sliced_secs).abs() < 1e-6);
        debug!(
            date = %self.date,
            slices = self.slices.len(),
            usage_secs = self.usage_secs,
            "froze daily bucket"
        );

        DailyBucket {
            date: self.date,
            window_start: self.window_start,
            window_end: self.window_end,
            slices: self.slices,
            usage_secs: self.usage_secs,
            events: self.events,
            signals: self.signals,
            event_counts: self.event_counts,
            ahi_event_count: self.ahi_event_count,
            ahi: self.ahi,
            peak_rolling_ahi: self.peak_rolling_ahi,
            rolling_ahi: self.rolling_ahi,
            usage_per_minute: self.usage_per_minute,
            pressure: self.pressure,
            leak: self.leak,
            flex_duty_cycle: self.flex_duty_cycle,
            breaths: self.breaths,
            flow_limitation: self.flow_limitation,
            episodes: self.episodes,
            run_id: stamp.run_id,
            computed_at: stamp.computed_at,
        }
    }
}
