//! Chunk decoder for raw data-card files.
//!
//! This module contains:
//! - Chunk header parsing and validation
//! - Event-stream decoding with bounded resynchronization
//! - Interval/waveform chunk decoding
//! - Settings scanning for the device minimum pressure
//! - The per-file driver that assembles sessions

pub mod events;
pub mod file;
pub mod header;
pub mod interval;
pub mod settings;

pub use events::{decode_event_stream, EventBatch, EventStream, SizeTable, RESYNC_WINDOW};
pub use file::{decode_file, sniff_kind, DecodedFile, FileKind, HeaderSummary};
pub use header::{parse_chunk_header, ChunkHeader, HeaderType};
