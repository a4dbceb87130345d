//! Local calendar days and the one-minute grid laid over them.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

const MINUTE_MS: i64 = 60_000;

/// Calendar date of an instant in `tz`.
pub fn local_date(t: DateTime<Utc>, tz: Tz) -> NaiveDate {
    t.with_timezone(&tz).date_naive()
}

/// First instant of `date` in `tz`.
///
/// When midnight falls into a DST gap the first valid local time after it
/// is used.
pub fn local_day_start(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::default());
    for minutes in (0..=180).step_by(15) {
        let naive = midnight + Duration::minutes(minutes);
        if let Some(t) = tz.from_local_datetime(&naive).earliest() {
            return t.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&midnight)
}

/// `[local midnight, next local midnight)` of `date`.
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_day_start(date, tz);
    let end = date
        .succ_opt()
        .map(|next| local_day_start(next, tz))
        .unwrap_or(start + Duration::hours(24));
    (start, end)
}

/// One-minute bins starting at `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteGrid {
    pub origin: DateTime<Utc>,
    pub minutes: usize,
}

impl MinuteGrid {
    /// Grid covering `[start, end)`; a trailing partial minute gets its own bin.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let ms = (end - start).num_milliseconds().max(0);
        Self {
            origin: start,
            minutes: ((ms + MINUTE_MS - 1) / MINUTE_MS) as usize,
        }
    }

    pub fn len(&self) -> usize {
        self.minutes
    }

    pub fn is_empty(&self) -> bool {
        self.minutes == 0
    }

    pub fn minute_start(&self, index: usize) -> DateTime<Utc> {
        self.origin + Duration::minutes(index as i64)
    }

    /// Bin containing `t`, if any.
    pub fn index_of(&self, t: DateTime<Utc>) -> Option<usize> {
        let ms = (t - self.origin).num_milliseconds();
        if ms < 0 {
            return None;
        }
        let index = (ms / MINUTE_MS) as usize;
        (index < self.minutes).then_some(index)
    }

    /// Add the seconds of `[start, end)` falling in each bin.
    pub fn add_coverage(&self, start: DateTime<Utc>, end: DateTime<Utc>, bins: &mut [f64]) {
        let lo = (start - self.origin).num_milliseconds().max(0);
        let hi = (end - self.origin)
            .num_milliseconds()
            .min(self.minutes as i64 * MINUTE_MS);
        if hi <= lo {
            return;
        }

        let first = (lo / MINUTE_MS) as usize;
        let last = ((hi - 1) / MINUTE_MS) as usize;
        for (index, bin) in bins.iter_mut().enumerate().take(last + 1).skip(first) {
            let bin_lo = index as i64 * MINUTE_MS;
            let bin_hi = bin_lo + MINUTE_MS;
            let overlap = hi.min(bin_hi) - lo.max(bin_lo);
            if overlap > 0 {
                *bin += overlap as f64 / 1000.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_day_bounds_in_utc() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let (start, end) = local_day_bounds(date, Tz::UTC);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(end - start, Duration::hours(24));
    }

    #[test]
    fn test_dst_day_is_short() {
        // Europe/Berlin springs forward on 2024-03-31.
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let (start, end) = local_day_bounds(date, chrono_tz::Europe::Berlin);
        assert_eq!(end - start, Duration::hours(23));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 30, 23, 0, 0).unwrap());
    }

    #[test]
    fn test_local_date_uses_zone() {
        let t = Utc.with_ymd_and_hms(2024, 3, 2, 3, 0, 0).unwrap();
        assert_eq!(
            local_date(t, chrono_tz::America::New_York),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        assert_eq!(local_date(t, Tz::UTC), NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
    }

    #[test]
    fn test_grid_indexing() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let grid = MinuteGrid::new(origin, origin + Duration::seconds(150));
        assert_eq!(grid.len(), 3);
        assert_eq!(grid.index_of(origin), Some(0));
        assert_eq!(grid.index_of(origin + Duration::seconds(119)), Some(1));
        assert_eq!(grid.index_of(origin + Duration::seconds(180)), None);
        assert_eq!(grid.index_of(origin - Duration::seconds(1)), None);
    }

    #[test]
    fn test_coverage_splits_across_minutes() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let grid = MinuteGrid::new(origin, origin + Duration::minutes(4));
        let mut bins = vec![0.0; grid.len()];

        grid.add_coverage(
            origin + Duration::seconds(30),
            origin + Duration::seconds(150),
            &mut bins,
        );
        assert_eq!(bins, vec![30.0, 60.0, 30.0, 0.0]);

        // Spans hanging off the grid are clipped.
        grid.add_coverage(
            origin - Duration::minutes(5),
            origin + Duration::seconds(10),
            &mut bins,
        );
        assert_eq!(bins[0], 40.0);
    }
}
