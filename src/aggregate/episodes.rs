//! Episode detection and snore context correlation.

use super::flow_limitation::Severity;
use super::intervals::WeightedInterval;
use super::timeline::MinuteGrid;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    Snore,
    Leak,
    HighFlowLimitation,
}

/// A closed time range `[start, end]` of sustained activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub kind: EpisodeKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Events, intervals, or minutes the episode was built from
    pub count: usize,
}

impl Episode {
    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }

    /// Both ranges are closed, so touching episodes overlap.
    pub fn overlaps(&self, other: &Episode) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn overlap_secs(&self, other: &Episode) -> f64 {
        let lo = self.start.max(other.start);
        let hi = self.end.min(other.end);
        ((hi - lo).num_milliseconds().max(0)) as f64 / 1000.0
    }
}

/// Cluster sorted instants: a gap of at most `gap_secs` keeps the episode open.
pub fn cluster_instants(kind: EpisodeKind, times: &[DateTime<Utc>], gap_secs: f64) -> Vec<Episode> {
    let gap = Duration::milliseconds((gap_secs.max(0.0) * 1000.0).round() as i64);
    let mut episodes: Vec<Episode> = Vec::new();

    for &t in times {
        match episodes.last_mut() {
            Some(current) if t - current.end <= gap => {
                current.end = current.end.max(t);
                current.count += 1;
            }
            _ => episodes.push(Episode {
                kind,
                start: t,
                end: t,
                count: 1,
            }),
        }
    }

    episodes
}

/// Runs of leak above `threshold`, joined across gaps up to `gap_secs` and
/// kept when at least `min_secs` long. `intervals` must be sorted by start.
pub fn leak_episodes(
    intervals: &[WeightedInterval],
    threshold: f64,
    min_secs: f64,
    gap_secs: f64,
) -> Vec<Episode> {
    let gap = Duration::milliseconds((gap_secs.max(0.0) * 1000.0).round() as i64);
    let mut episodes: Vec<Episode> = Vec::new();

    for interval in intervals.iter().filter(|i| i.value > threshold) {
        let end = interval.end();
        match episodes.last_mut() {
            Some(current) if interval.start - current.end <= gap => {
                current.end = current.end.max(end);
                current.count += 1;
            }
            _ => episodes.push(Episode {
                kind: EpisodeKind::Leak,
                start: interval.start,
                end,
                count: 1,
            }),
        }
    }

    episodes.retain(|e| e.duration_secs() >= min_secs);
    episodes
}

/// Contiguous minutes classified `High`.
pub fn high_flow_limitation_episodes(
    grid: &MinuteGrid,
    severity: &[Option<Severity>],
) -> Vec<Episode> {
    let mut episodes = Vec::new();
    let mut run_start: Option<usize> = None;

    for index in 0..=severity.len() {
        let high = severity.get(index) == Some(&Some(Severity::High));
        match (high, run_start) {
            (true, None) => run_start = Some(index),
            (false, Some(first)) => {
                episodes.push(Episode {
                    kind: EpisodeKind::HighFlowLimitation,
                    start: grid.minute_start(first),
                    end: grid.minute_start(index),
                    count: index - first,
                });
                run_start = None;
            }
            _ => {}
        }
    }

    episodes
}

/// What a snore episode coincided with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnoreContext {
    Both,
    LeakOnly,
    FlowLimitationOnly,
    Neither,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnoreCorrelation {
    pub episode: Episode,
    pub context: SnoreContext,
    pub leak_overlap_secs: f64,
    pub flow_limitation_overlap_secs: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeCorrelation {
    pub snores: Vec<SnoreCorrelation>,
    pub both: usize,
    pub leak_only: usize,
    pub flow_limitation_only: usize,
    pub neither: usize,
}

/// Classify every snore episode by the leak and high-FL episodes it overlaps.
pub fn correlate(
    snore: &[Episode],
    leak: &[Episode],
    flow_limitation: &[Episode],
) -> EpisodeCorrelation {
    let mut result = EpisodeCorrelation::default();

    for episode in snore {
        let overlapping = |others: &[Episode]| -> (bool, f64) {
            others
                .iter()
                .filter(|o| o.overlaps(episode))
                .fold((false, 0.0), |(_, secs), o| (true, secs + o.overlap_secs(episode)))
        };
        let (with_leak, leak_overlap_secs) = overlapping(leak);
        let (with_fl, flow_limitation_overlap_secs) = overlapping(flow_limitation);

        let context = match (with_leak, with_fl) {
            (true, true) => {
                result.both += 1;
                SnoreContext::Both
            }
            (true, false) => {
                result.leak_only += 1;
                SnoreContext::LeakOnly
            }
            (false, true) => {
                result.flow_limitation_only += 1;
                SnoreContext::FlowLimitationOnly
            }
            (false, false) => {
                result.neither += 1;
                SnoreContext::Neither
            }
        };

        result.snores.push(SnoreCorrelation {
            episode: *episode,
            context,
            leak_overlap_secs,
            flow_limitation_overlap_secs,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn interval(start: i64, secs: f64, value: f64) -> WeightedInterval {
        WeightedInterval {
            start: at(start),
            duration_secs: secs,
            value,
        }
    }

    #[test]
    fn test_cluster_instants() {
        let times = vec![at(0), at(30), at(100), at(400), at(450)];
        let episodes = cluster_instants(EpisodeKind::Snore, &times, 120.0);
        assert_eq!(episodes.len(), 2);
        assert_eq!((episodes[0].start, episodes[0].end), (at(0), at(100)));
        assert_eq!(episodes[0].count, 3);
        assert_eq!(episodes[1].count, 2);
    }

    #[test]
    fn test_gap_tolerance_is_monotonic() {
        let times: Vec<_> = [0, 10, 45, 200, 230, 600, 1000, 1030]
            .iter()
            .map(|&s| at(s))
            .collect();
        let mut last = usize::MAX;
        for gap in [0.0, 10.0, 30.0, 60.0, 200.0, 400.0, 1000.0] {
            let count = cluster_instants(EpisodeKind::Snore, &times, gap).len();
            assert!(count <= last, "gap {gap} produced more episodes");
            last = count;
        }
        assert_eq!(last, 1);
    }

    #[test]
    fn test_leak_episodes_join_and_filter() {
        let intervals = vec![
            interval(0, 30.0, 40.0),
            interval(30, 30.0, 10.0),
            interval(60, 30.0, 45.0),
            interval(500, 20.0, 60.0),
        ];
        let episodes = leak_episodes(&intervals, 24.0, 60.0, 60.0);

        // The first two over-threshold runs are joined across the 30 s dip;
        // the 20 s run at 500 s is too short.
        assert_eq!(episodes.len(), 1);
        assert_eq!((episodes[0].start, episodes[0].end), (at(0), at(90)));
        assert_eq!(episodes[0].count, 2);
    }

    #[test]
    fn test_high_flow_limitation_runs() {
        let origin = at(0);
        let grid = MinuteGrid::new(origin, origin + Duration::minutes(6));
        let severity = vec![
            Some(Severity::High),
            Some(Severity::High),
            None,
            Some(Severity::Medium),
            Some(Severity::High),
            Some(Severity::High),
        ];

        let episodes = high_flow_limitation_episodes(&grid, &severity);
        assert_eq!(episodes.len(), 2);
        assert_eq!(episodes[0].end, origin + Duration::minutes(2));
        assert_eq!(episodes[1].start, origin + Duration::minutes(4));
        assert_eq!(episodes[1].end, origin + Duration::minutes(6));
    }

    #[test]
    fn test_correlation_classes() {
        let ep = |kind, s, e| Episode {
            kind,
            start: at(s),
            end: at(e),
            count: 1,
        };
        let snores = vec![
            ep(EpisodeKind::Snore, 0, 100),
            ep(EpisodeKind::Snore, 200, 300),
            ep(EpisodeKind::Snore, 400, 500),
            ep(EpisodeKind::Snore, 600, 700),
        ];
        let leaks = vec![ep(EpisodeKind::Leak, 50, 250)];
        let fl = vec![
            ep(EpisodeKind::HighFlowLimitation, 90, 110),
            ep(EpisodeKind::HighFlowLimitation, 450, 800),
        ];

        let result = correlate(&snores, &leaks, &fl);
        let contexts: Vec<_> = result.snores.iter().map(|s| s.context).collect();
        assert_eq!(
            contexts,
            vec![
                SnoreContext::Both,
                SnoreContext::LeakOnly,
                SnoreContext::FlowLimitationOnly,
                SnoreContext::FlowLimitationOnly,
            ]
        );
        assert_eq!(result.snores[0].leak_overlap_secs, 50.0);
        assert_eq!(result.snores[0].flow_limitation_overlap_secs, 10.0);
        assert_eq!(result.both + result.leak_only + result.flow_limitation_only, 4);
        assert_eq!(result.neither, 0);
    }
}
