//! CPAP Card Analytics - decode device data cards into nightly therapy statistics.
//!
//! This library turns the raw files copied from a CPAP data card into
//! sessions, per-night statistics, weekly and monthly trends, and a
//! multi-resolution index for browsing long waveforms.
//!
//! # Guarantees
//!
//! - **No I/O in the core**: every stage works on byte buffers and in-memory values
//! - **Per-file isolation**: one corrupt file never aborts a whole-card import
//! - **Undefined, not zero**: statistics without data are `None`
//! - **Frozen results**: buckets are immutable once an aggregation run returns
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     CPAP Card Analytics                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Decoder   │──▶│   Session   │──▶│    Daily    │         │
//! │  │  (chunks)   │   │   Merger    │   │ Aggregator  │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         │                 │                 │                │
//! │         ▼                 ▼                 ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │ Import Log  │   │  Waveform   │   │   Trends    │         │
//! │  │ (counters)  │   │   Index     │   │ (week/month)│         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cpap_card_analytics::{aggregate_days, decode_file, merge_sessions, AggregatorConfig};
//!
//! let bytes = std::fs::read("DATALOG/0000001A.001").expect("read card file");
//! let decoded = decode_file(&bytes, Some("0000001A.001"));
//!
//! let sessions = merge_sessions(decoded.sessions);
//! for day in aggregate_days(&sessions, &AggregatorConfig::default()) {
//!     println!("{}: AHI {:?}", day.date, day.ahi);
//! }
//! ```

pub mod aggregate;
pub mod binary;
pub mod breath;
pub mod config;
pub mod decoder;
pub mod import;
pub mod session;
pub mod waveform;

// Re-export key types at crate root for convenience
pub use aggregate::{
    aggregate_days, monthly, weekly, DailyAggregator, DailyBucket, TrendBucket, TrendPeriod,
};
pub use config::{AggregatorConfig, Config, ConfigError, ImportConfig};
pub use decoder::{decode_file, DecodedFile, FileKind};
pub use import::{run_pipeline, CardFile, ImportError, ImportLog, PipelineOutput};
pub use session::{merge_sessions, Event, EventKind, Session, SignalSample, SignalType};
pub use waveform::{EnvelopePoint, WaveformIndex};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
