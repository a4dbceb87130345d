//! Whole-card import: parallel decode, merge, aggregate, index.
//!
//! Files are decoded by a small pool of worker threads fed through a
//! crossbeam channel. Each decode runs under `catch_unwind`, so a file that
//! trips a bug is counted and logged while the rest of the card still comes
//! through. The remaining stages need every session at once and run on the
//! calling thread.

use super::log::{ImportLog, ImportStats};
use crate::aggregate::{monthly, weekly, DailyAggregator, DailyBucket, TrendBucket};
use crate::config::Config;
use crate::decoder::{decode_file, DecodedFile, FileKind, HeaderSummary};
use crate::session::{merge_sessions, Session};
use crate::waveform::WaveformIndex;
use crossbeam_channel::unbounded;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One file read from the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFile {
    /// Path or name, used for sniffing and provenance
    pub name: String,
    pub bytes: Vec<u8>,
}

impl CardFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// A file whose decode did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub source: String,
    pub reason: String,
}

/// Decoded files in input order, plus the files that failed.
#[derive(Debug, Clone)]
pub struct CardImport {
    pub files: Vec<DecodedFile>,
    pub failures: Vec<FileFailure>,
}

/// What a file contributed, without its sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub source: String,
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderSummary>,
    pub sessions: usize,
}

/// Frozen result of a full import run.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub files: Vec<FileReport>,
    pub failures: Vec<FileFailure>,
    pub stats: ImportStats,
    /// Sessions after merging
    pub sessions: Vec<Session>,
    pub days: Vec<Arc<DailyBucket>>,
    pub weeks: Vec<TrendBucket>,
    pub months: Vec<TrendBucket>,
    pub index: WaveformIndex,
}

/// Import errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportError {
    /// The cancellation flag was raised; partial results were discarded
    Cancelled,
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Cancelled => write!(f, "import cancelled"),
        }
    }
}

impl std::error::Error for ImportError {}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "decoder panicked".to_string()
    }
}

fn check_cancel(cancel: &AtomicBool) -> Result<(), ImportError> {
    if cancel.load(Ordering::Relaxed) {
        Err(ImportError::Cancelled)
    } else {
        Ok(())
    }
}

/// Decode every file on `workers` threads.
///
/// Per-file failures never abort the import. Raising `cancel` stops the
/// workers after their current file and discards everything.
pub fn decode_card(
    files: &[CardFile],
    workers: usize,
    cancel: &AtomicBool,
    log: &ImportLog,
) -> Result<CardImport, ImportError> {
    let workers = workers.clamp(1, files.len().max(1));

    let (job_tx, job_rx) = unbounded::<usize>();
    for index in 0..files.len() {
        // The receiver is alive, so an unbounded send cannot fail.
        let _ = job_tx.send(index);
    }
    drop(job_tx);

    let (result_tx, result_rx) = unbounded::<(usize, Result<DecodedFile, String>)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                while let Ok(index) = job_rx.recv() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let file = &files[index];
                    log.record_file_seen();
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        decode_file(&file.bytes, Some(&file.name))
                    }))
                    .map_err(panic_message);
                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    check_cancel(cancel)?;

    let mut outcomes: Vec<(usize, Result<DecodedFile, String>)> = result_rx.iter().collect();
    outcomes.sort_by_key(|(index, _)| *index);

    let mut decoded = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (index, outcome) in outcomes {
        match outcome {
            Ok(file) => {
                match file.kind {
                    FileKind::ChunkContainer => {
                        let events: usize = file.sessions.iter().map(|s| s.events.len()).sum();
                        let checksum_failures = file
                            .header
                            .as_ref()
                            .map(|h| h.crc_failures + h.header_checksum_failures)
                            .unwrap_or(0);
                        log.record_file_decoded(
                            file.sessions.len() as u64,
                            events as u64,
                            checksum_failures as u64,
                        );
                    }
                    FileKind::Edf | FileKind::LegacyFrameStream => log.record_file_skipped(),
                    FileKind::Unknown => log.record_file_unrecognized(),
                }
                decoded.push(file);
            }
            Err(reason) => {
                let source = files[index].name.clone();
                warn!(%source, %reason, "file decode failed; continuing with the rest of the card");
                log.record_file_failed();
                failures.push(FileFailure { source, reason });
            }
        }
    }

    Ok(CardImport {
        files: decoded,
        failures,
    })
}

/// Decode, merge, aggregate, roll up, and index a whole card.
pub fn run_pipeline(
    files: &[CardFile],
    config: &Config,
    cancel: &AtomicBool,
) -> Result<PipelineOutput, ImportError> {
    let log = ImportLog::new();
    let import = decode_card(files, config.import.workers, cancel, &log)?;

    let mut reports = Vec::with_capacity(import.files.len());
    let mut sessions = Vec::new();
    for file in import.files {
        reports.push(FileReport {
            source: file.source,
            kind: file.kind,
            header: file.header,
            sessions: file.sessions.len(),
        });
        sessions.extend(file.sessions);
    }

    let sessions = merge_sessions(sessions);
    check_cancel(cancel)?;

    let days = DailyAggregator::new(config.aggregator.clone()).aggregate(&sessions);
    check_cancel(cancel)?;

    let weeks = weekly(&days);
    let months = monthly(&days);
    let index = WaveformIndex::build(&sessions);
    check_cancel(cancel)?;

    let stats = log.stats();
    info!(
        files = stats.files_seen,
        failed = stats.files_failed,
        sessions = sessions.len(),
        days = days.len(),
        "card import complete"
    );

    Ok(PipelineOutput {
        files: reports,
        failures: import.failures,
        stats,
        sessions,
        days,
        weeks,
        months,
        index,
    })
}
