//! Breath segmentation from a flow waveform.
//!
//! Breaths are delimited by inspiratory onsets: zero crossings from negative
//! to positive flow, confirmed by a hysteresis band so that noise around zero
//! does not split breaths. Each breath runs from one inspiratory onset to the
//! next, with the expiratory onset in between splitting Ti from Te.

use crate::breath::flow_limitation::flow_limitation_score;
use crate::session::types::{Breath, WaveformChannel};
use serde::{Deserialize, Serialize};

/// Tuning for breath segmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreathConfig {
    /// Centered moving-average window applied before onset detection
    pub smoothing_secs: f64,
    /// Flow (L/min) that must be exceeded on either side of zero
    pub hysteresis_lpm: f64,
    pub min_breath_secs: f64,
    pub max_breath_secs: f64,
    pub min_tidal_volume_ml: f64,
}

impl Default for BreathConfig {
    fn default() -> Self {
        Self {
            smoothing_secs: 0.2,
            hysteresis_lpm: 2.0,
            min_breath_secs: 1.0,
            max_breath_secs: 20.0,
            min_tidal_volume_ml: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inspiration,
    Expiration,
}

/// A phase change at a sample index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Onset {
    index: usize,
    phase: Phase,
}

/// Segment a flow waveform into breaths.
pub fn segment_breaths(wave: &WaveformChannel, config: &BreathConfig) -> Vec<Breath> {
    if wave.sample_rate <= 0.0 || wave.samples.len() < 2 {
        return Vec::new();
    }

    let window = ((config.smoothing_secs * wave.sample_rate).round() as usize).max(1);
    let smoothed = moving_average(&wave.samples, window);
    let onsets = detect_onsets(&smoothed, config.hysteresis_lpm);

    // Onsets alternate I, E, I, E, ... so every even-aligned triple is a breath.
    let mut breaths = Vec::new();
    for triple in onsets.windows(3).step_by(2) {
        let (start, exp, next) = (triple[0], triple[1], triple[2]);
        debug_assert_eq!(start.phase, Phase::Inspiration);
        debug_assert_eq!(exp.phase, Phase::Expiration);
        debug_assert_eq!(next.phase, Phase::Inspiration);

        if let Some(breath) = build_breath(wave, start.index, exp.index, next.index, config) {
            breaths.push(breath);
        }
    }

    breaths
}

fn build_breath(
    wave: &WaveformChannel,
    start: usize,
    exp: usize,
    end: usize,
    config: &BreathConfig,
) -> Option<Breath> {
    let rate = wave.sample_rate;
    let duration_secs = (end - start) as f64 / rate;
    if duration_secs < config.min_breath_secs || duration_secs > config.max_breath_secs {
        return None;
    }

    let insp_time_secs = (exp - start) as f64 / rate;
    let exp_time_secs = (end - exp) as f64 / rate;
    if insp_time_secs <= 0.0 || exp_time_secs <= 0.0 {
        return None;
    }

    let inspiration = &wave.samples[start..exp];
    // L/min integrated over seconds -> litres.
    let tidal_volume_l: f64 = inspiration
        .iter()
        .map(|&v| (v.max(0.0)) as f64)
        .sum::<f64>()
        / 60.0
        / rate;
    let tidal_volume_ml = tidal_volume_l * 1000.0;
    if tidal_volume_ml < config.min_tidal_volume_ml {
        return None;
    }

    let respiratory_rate = 60.0 / duration_secs;

    Some(Breath {
        start: wave.time_at(start),
        duration_secs,
        tidal_volume_ml,
        respiratory_rate,
        minute_ventilation: tidal_volume_l * respiratory_rate,
        insp_time_secs,
        exp_time_secs,
        ie_ratio: insp_time_secs / exp_time_secs,
        flow_limitation: flow_limitation_score(inspiration),
    })
}

/// Centered moving average with a window of `window` samples.
fn moving_average(samples: &[f32], window: usize) -> Vec<f32> {
    if window <= 1 {
        return samples.to_vec();
    }

    let half = window / 2;
    let mut prefix = Vec::with_capacity(samples.len() + 1);
    prefix.push(0.0f64);
    for &s in samples {
        let last = *prefix.last().unwrap_or(&0.0);
        prefix.push(last + s as f64);
    }

    (0..samples.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(samples.len());
            ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32
        })
        .collect()
}

/// Alternating inspiration/expiration onsets, starting with an inspiration.
fn detect_onsets(smoothed: &[f32], hysteresis: f64) -> Vec<Onset> {
    let h = hysteresis as f32;
    let mut onsets = Vec::new();
    // The first onset is only trusted after a confirmed expiration.
    let mut phase: Option<Phase> = None;

    for (i, &v) in smoothed.iter().enumerate() {
        match phase {
            None if v < -h => phase = Some(Phase::Expiration),
            Some(Phase::Expiration) if v > h => {
                let at = last_crossing(smoothed, i, |x| x <= 0.0);
                onsets.push(Onset {
                    index: at,
                    phase: Phase::Inspiration,
                });
                phase = Some(Phase::Inspiration);
            }
            Some(Phase::Inspiration) if v < -h => {
                let at = last_crossing(smoothed, i, |x| x >= 0.0);
                onsets.push(Onset {
                    index: at,
                    phase: Phase::Expiration,
                });
                phase = Some(Phase::Expiration);
            }
            _ => {}
        }
    }

    onsets
}

/// Index just after the last sample before `from` satisfying `before`.
fn last_crossing(samples: &[f32], from: usize, before: impl Fn(f32) -> bool) -> usize {
    (0..from)
        .rev()
        .find(|&j| before(samples[j]))
        .map_or(from, |j| j + 1)
}
