//! Counters for a card import.
//!
//! Workers record into one shared log while files are decoded in parallel;
//! callers read a snapshot once the run is over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Running statistics of one import.
#[derive(Debug)]
pub struct ImportLog {
    /// Files handed to the decoder
    files_seen: AtomicU64,
    /// Files recognized as a chunk container
    files_decoded: AtomicU64,
    /// Files of a known kind whose contents are not decoded
    files_skipped: AtomicU64,
    /// Files matching no known kind
    files_unrecognized: AtomicU64,
    /// Files whose decode panicked
    files_failed: AtomicU64,
    sessions_decoded: AtomicU64,
    events_decoded: AtomicU64,
    /// Chunks whose trailer or header checksum did not match
    checksum_failures: AtomicU64,
    started: DateTime<Utc>,
}

impl ImportLog {
    pub fn new() -> Self {
        Self {
            files_seen: AtomicU64::new(0),
            files_decoded: AtomicU64::new(0),
            files_skipped: AtomicU64::new(0),
            files_unrecognized: AtomicU64::new(0),
            files_failed: AtomicU64::new(0),
            sessions_decoded: AtomicU64::new(0),
            events_decoded: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            started: Utc::now(),
        }
    }

    pub fn record_file_seen(&self) {
        self.files_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded container and what came out of it.
    pub fn record_file_decoded(&self, sessions: u64, events: u64, checksum_failures: u64) {
        self.files_decoded.fetch_add(1, Ordering::Relaxed);
        self.sessions_decoded.fetch_add(sessions, Ordering::Relaxed);
        self.events_decoded.fetch_add(events, Ordering::Relaxed);
        self.checksum_failures
            .fetch_add(checksum_failures, Ordering::Relaxed);
    }

    pub fn record_file_skipped(&self) {
        self.files_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_unrecognized(&self) {
        self.files_unrecognized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> ImportStats {
        ImportStats {
            files_seen: self.files_seen.load(Ordering::Relaxed),
            files_decoded: self.files_decoded.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_unrecognized: self.files_unrecognized.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            sessions_decoded: self.sessions_decoded.load(Ordering::Relaxed),
            events_decoded: self.events_decoded.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            started: self.started,
            elapsed_ms: (Utc::now() - self.started).num_milliseconds().max(0) as u64,
        }
    }
}

impl Default for ImportLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of import statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStats {
    pub files_seen: u64,
    pub files_decoded: u64,
    pub files_skipped: u64,
    pub files_unrecognized: u64,
    pub files_failed: u64,
    pub sessions_decoded: u64,
    pub events_decoded: u64,
    pub checksum_failures: u64,
    pub started: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl ImportStats {
    /// Multi-line summary for display.
    pub fn summary(&self) -> String {
        format!(
            "Import Statistics:\n\
             - Files seen: {}\n\
             - Containers decoded: {}\n\
             - Recognized but not decoded: {}\n\
             - Unrecognized: {}\n\
             - Failed: {}\n\
             - Sessions decoded: {}\n\
             - Events decoded: {}\n\
             - Checksum mismatches: {}\n\
             - Elapsed: {} ms",
            self.files_seen,
            self.files_decoded,
            self.files_skipped,
            self.files_unrecognized,
            self.files_failed,
            self.sessions_decoded,
            self.events_decoded,
            self.checksum_failures,
            self.elapsed_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_log_counting() {
        let log = ImportLog::new();

        log.record_file_seen();
        log.record_file_seen();
        log.record_file_decoded(2, 40, 1);
        log.record_file_unrecognized();

        let stats = log.stats();
        assert_eq!(stats.files_seen, 2);
        assert_eq!(stats.files_decoded, 1);
        assert_eq!(stats.sessions_decoded, 2);
        assert_eq!(stats.events_decoded, 40);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.files_unrecognized, 1);
    }

    #[test]
    fn test_log_shared_across_scoped_threads() {
        let log = ImportLog::new();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        log.record_file_seen();
                    }
                });
            }
        });
        assert_eq!(log.stats().files_seen, 100);
    }

    #[test]
    fn test_summary_format() {
        let log = ImportLog::new();
        log.record_file_decoded(1, 3, 2);
        let summary = log.stats().summary();
        assert!(summary.contains("Files seen: 0"));
        assert!(summary.contains("Checksum mismatches: 2"));
    }
}
