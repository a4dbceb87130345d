//! Trailing-window apnea-hypopnea index at one-minute resolution.

use serde::{Deserialize, Serialize};

/// Windows with less therapy time than this report no rate.
pub const MIN_WINDOW_USAGE_SECS: f64 = 60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingAhi {
    pub window_minutes: u32,
    /// Events per usage hour over the window ending at each minute
    pub rates: Vec<Option<f64>>,
}

impl RollingAhi {
    pub fn peak(&self) -> Option<f64> {
        self.rates.iter().flatten().copied().reduce(f64::max)
    }
}

/// Rate over the trailing `window` minutes ending at each minute (inclusive).
pub fn rolling_ahi(usage_secs: &[f64], events: &[u32], window_minutes: u32) -> RollingAhi {
    let window = (window_minutes as usize).max(1);
    let len = usage_secs.len().min(events.len());

    let mut usage_sum = 0.0;
    let mut event_sum = 0u64;
    let mut rates = Vec::with_capacity(len);

    for i in 0..len {
        usage_sum += usage_secs[i];
        event_sum += u64::from(events[i]);
        if i >= window {
            usage_sum -= usage_secs[i - window];
            event_sum -= u64::from(events[i - window]);
        }

        let rate = (usage_sum >= MIN_WINDOW_USAGE_SECS)
            .then(|| event_sum as f64 / (usage_sum / 3600.0));
        rates.push(rate);
    }

    RollingAhi {
        window_minutes,
        rates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_rate() {
        // Full usage, one event every ten minutes: 6 per hour.
        let usage = vec![60.0; 120];
        let events: Vec<u32> = (0..120).map(|m| u32::from(m % 10 == 0)).collect();

        let series = rolling_ahi(&usage, &events, 30);
        assert_eq!(series.rates.len(), 120);
        assert!((series.rates[119].unwrap() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_idle_minutes_have_no_rate() {
        let usage = vec![0.0, 0.0, 30.0, 60.0];
        let events = vec![0, 0, 1, 0];

        let series = rolling_ahi(&usage, &events, 5);
        assert_eq!(series.rates[0], None);
        assert_eq!(series.rates[2], None);
        assert!((series.rates[3].unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_peak() {
        let usage = vec![60.0; 10];
        let mut events = vec![0; 10];
        events[4] = 3;

        let series = rolling_ahi(&usage, &events, 5);
        // Three events within five minutes of use.
        assert!((series.peak().unwrap() - 36.0).abs() < 1e-9);
    }
}
