//! Per-breath inspiratory flow-limitation score.
//!
//! A normal inspiration is roughly a half sine; a limited one flattens into a
//! plateau. The score compares the coefficient of variation of the middle
//! half of the inspiration (normalized to its peak) with that of an ideal
//! half sine: a sine scores 0, a perfect plateau scores 1.

use statrs::statistics::Statistics;

/// Coefficient of variation of sin(x) for x uniform on [pi/4, 3pi/4].
const SINE_MID_CV: f64 = 0.0977;

/// Fewest inspiratory samples that give a meaningful shape.
const MIN_INSPIRATORY_SAMPLES: usize = 8;

/// Score the inspiratory part of one breath in [0, 1].
///
/// Returns `None` when the inspiration is too short or never goes positive.
pub fn flow_limitation_score(inspiration: &[f32]) -> Option<f64> {
    let n = inspiration.len();
    if n < MIN_INSPIRATORY_SAMPLES {
        return None;
    }

    let peak = inspiration.iter().copied().fold(f32::MIN, f32::max) as f64;
    if peak <= 0.0 {
        return None;
    }

    let mid: Vec<f64> = inspiration[n / 4..n - n / 4]
        .iter()
        .map(|&v| v as f64 / peak)
        .collect();
    let mean = mid.iter().mean();
    if !mean.is_finite() || mean <= 0.0 {
        return None;
    }
    let cv = mid.iter().population_std_dev() / mean;

    Some(((SINE_MID_CV - cv) / SINE_MID_CV).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    fn half_sine(n: usize, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amplitude * (PI * (i as f32 + 0.5) / n as f32).sin())
            .collect()
    }

    #[test]
    fn test_sine_scores_low() {
        let score = flow_limitation_score(&half_sine(50, 30.0)).unwrap();
        assert!(score < 0.2, "sine scored {score}");
    }

    #[test]
    fn test_plateau_scores_high() {
        let mut insp: Vec<f32> = (1..=5).map(|i| i as f32 * 5.0).collect();
        insp.extend(std::iter::repeat(25.0).take(40));
        insp.extend((1..=5).rev().map(|i| i as f32 * 5.0));

        let score = flow_limitation_score(&insp).unwrap();
        assert!(score > 0.9, "plateau scored {score}");
    }

    #[test]
    fn test_degenerate_inspirations() {
        assert_eq!(flow_limitation_score(&[1.0, 2.0, 1.0]), None);
        assert_eq!(flow_limitation_score(&[-1.0; 20]), None);
    }

    #[test]
    fn test_score_is_bounded() {
        let jagged: Vec<f32> = (0..40).map(|i| if i % 2 == 0 { 30.0 } else { 1.0 }).collect();
        let score = flow_limitation_score(&jagged).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }
}
