//! Multi-resolution min/max index for viewport queries.
//!
//! Level 0 is the raw sample list. Level `k` (k >= 1) holds fixed-width
//! time buckets of `LEVEL1_WIDTH_MS * FANOUT^(k-1)` milliseconds, each with
//! the min and max of the samples inside it. Buckets are stored sparsely, so
//! gaps between sessions cost nothing. A range query is answered from the
//! coarsest buckets that fit entirely inside it, descending only at the
//! edges, so its cost depends on the response size rather than the length of
//! the recording.

use crate::session::{Session, SignalType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Width of a level-1 bucket.
pub const LEVEL1_WIDTH_MS: i64 = 1_000;

/// Width ratio between consecutive levels.
pub const FANOUT: i64 = 8;

/// Upper bound on levels; 1 s * 8^15 is far beyond any recording.
const MAX_LEVELS: usize = 16;

/// One output bucket of a viewport query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePoint {
    /// Start of the bucket (epoch milliseconds)
    pub timestamp_ms: i64,
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Envelope {
    bucket: i64,
    min: f32,
    max: f32,
}

fn widen(acc: &mut Option<(f32, f32)>, min: f32, max: f32) {
    *acc = Some(match *acc {
        Some((lo, hi)) => (lo.min(min), hi.max(max)),
        None => (min, max),
    });
}

/// Index over one signal.
#[derive(Debug, Clone, Default)]
pub struct SignalIndex {
    raw: Vec<(i64, f32)>,
    levels: Vec<Vec<Envelope>>,
}

impl SignalIndex {
    /// Build from `(epoch ms, value)` samples in any order.
    pub fn build(mut raw: Vec<(i64, f32)>) -> Self {
        raw.retain(|(_, v)| v.is_finite());
        raw.sort_by_key(|(t, _)| *t);

        let mut levels: Vec<Vec<Envelope>> = Vec::new();
        let mut width = LEVEL1_WIDTH_MS;
        while levels.len() < MAX_LEVELS {
            let level = match levels.last() {
                None => Self::bucket_raw(&raw, width),
                Some(finer) => Self::bucket_level(finer, FANOUT),
            };
            let done = level.len() <= 1;
            levels.push(level);
            if done {
                break;
            }
            width *= FANOUT;
        }

        Self { raw, levels }
    }

    fn bucket_raw(raw: &[(i64, f32)], width: i64) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = Vec::new();
        for &(t, v) in raw {
            let bucket = t.div_euclid(width);
            match out.last_mut() {
                Some(e) if e.bucket == bucket => {
                    e.min = e.min.min(v);
                    e.max = e.max.max(v);
                }
                _ => out.push(Envelope {
                    bucket,
                    min: v,
                    max: v,
                }),
            }
        }
        out
    }

    fn bucket_level(finer: &[Envelope], fanout: i64) -> Vec<Envelope> {
        let mut out: Vec<Envelope> = Vec::new();
        for e in finer {
            let bucket = e.bucket.div_euclid(fanout);
            match out.last_mut() {
                Some(c) if c.bucket == bucket => {
                    c.min = c.min.min(e.min);
                    c.max = c.max.max(e.max);
                }
                _ => out.push(Envelope {
                    bucket,
                    min: e.min,
                    max: e.max,
                }),
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// `[first, last]` sample instants in epoch ms.
    pub fn time_range(&self) -> Option<(i64, i64)> {
        Some((self.raw.first()?.0, self.raw.last()?.0))
    }

    fn width(level: usize) -> i64 {
        LEVEL1_WIDTH_MS * FANOUT.pow(level.saturating_sub(1) as u32)
    }

    /// Min and max of the samples with `start <= t < end`.
    pub fn range_min_max(&self, start: i64, end: i64) -> Option<(f32, f32)> {
        let mut acc = None;
        self.fold(self.levels.len(), start, end, &mut acc);
        acc
    }

    fn fold(&self, level: usize, start: i64, end: i64, acc: &mut Option<(f32, f32)>) {
        if start >= end {
            return;
        }
        if level == 0 {
            let lo = self.raw.partition_point(|(t, _)| *t < start);
            let hi = self.raw.partition_point(|(t, _)| *t < end);
            for &(_, v) in &self.raw[lo..hi] {
                widen(acc, v, v);
            }
            return;
        }

        let width = Self::width(level);
        // Buckets [first, last) lie entirely inside the range.
        let first = start.div_euclid(width) + i64::from(start.rem_euclid(width) != 0);
        let last = end.div_euclid(width);
        if first >= last {
            self.fold(level - 1, start, end, acc);
            return;
        }

        let envelopes = &self.levels[level - 1];
        let lo = envelopes.partition_point(|e| e.bucket < first);
        let hi = envelopes.partition_point(|e| e.bucket < last);
        for e in &envelopes[lo..hi] {
            widen(acc, e.min, e.max);
        }

        self.fold(level - 1, start, first * width, acc);
        self.fold(level - 1, last * width, end, acc);
    }

    /// Downsample `[start, end)` into at most `max_buckets` envelope points.
    ///
    /// Output buckets share one width and start at `start`; buckets without
    /// samples are omitted.
    pub fn query(&self, start: i64, end: i64, max_buckets: usize) -> Vec<EnvelopePoint> {
        if max_buckets == 0 || end <= start || self.raw.is_empty() {
            return Vec::new();
        }
        let span = end - start;
        let cap = max_buckets as i64;
        let width = ((span + cap - 1) / cap).max(1);

        // Skip straight to the data when the range begins in a gap.
        let first_sample = self.raw[self.raw.partition_point(|(t, _)| *t < start)..]
            .first()
            .map(|(t, _)| *t);
        let Some(first_sample) = first_sample else {
            return Vec::new();
        };

        let mut points = Vec::new();
        let mut j = (first_sample - start).max(0) / width;
        while j < cap {
            let bucket_start = start + j * width;
            if bucket_start >= end {
                break;
            }
            let bucket_end = (bucket_start + width).min(end);
            if let Some((min, max)) = self.range_min_max(bucket_start, bucket_end) {
                points.push(EnvelopePoint {
                    timestamp_ms: bucket_start,
                    min,
                    max,
                });
            }
            j += 1;
        }
        points
    }
}

/// Per-signal indexes built once from merged sessions.
#[derive(Debug, Clone, Default)]
pub struct WaveformIndex {
    signals: BTreeMap<SignalType, SignalIndex>,
}

impl WaveformIndex {
    /// Flow comes from waveform channels when any session carries one;
    /// every other signal comes from the low-rate samples.
    pub fn build(sessions: &[Session]) -> Self {
        let mut raw: BTreeMap<SignalType, Vec<(i64, f32)>> = BTreeMap::new();

        let has_waveform = sessions.iter().any(|s| s.waveform.is_some());
        for session in sessions {
            if let Some(wave) = &session.waveform {
                if wave.sample_rate > 0.0 {
                    let start_ms = wave.start.timestamp_millis();
                    let step = 1000.0 / wave.sample_rate;
                    raw.entry(SignalType::Flow).or_default().extend(
                        wave.samples
                            .iter()
                            .enumerate()
                            .map(|(i, v)| (start_ms + (i as f64 * step).round() as i64, *v)),
                    );
                }
            }
            for sample in &session.signals {
                if sample.signal == SignalType::Flow && has_waveform {
                    continue;
                }
                raw.entry(sample.signal)
                    .or_default()
                    .push((sample.timestamp.timestamp_millis(), sample.value as f32));
            }
        }

        let signals: BTreeMap<SignalType, SignalIndex> = raw
            .into_iter()
            .map(|(signal, samples)| (signal, SignalIndex::build(samples)))
            .collect();

        debug!(
            signals = signals.len(),
            samples = signals.values().map(SignalIndex::len).sum::<usize>(),
            "built waveform index"
        );
        Self { signals }
    }

    pub fn signals(&self) -> impl Iterator<Item = SignalType> + '_ {
        self.signals.keys().copied()
    }

    pub fn signal(&self, signal: SignalType) -> Option<&SignalIndex> {
        self.signals.get(&signal)
    }

    pub fn time_range(&self, signal: SignalType) -> Option<(i64, i64)> {
        self.signals.get(&signal)?.time_range()
    }

    /// Viewport query; an unindexed signal yields no points.
    pub fn query(
        &self,
        signal: SignalType,
        start_ms: i64,
        end_ms: i64,
        max_buckets: usize,
    ) -> Vec<EnvelopePoint> {
        self.signals
            .get(&signal)
            .map(|index| index.query(start_ms, end_ms, max_buckets))
            .unwrap_or_default()
    }
}
