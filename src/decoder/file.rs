//! Whole-file decoding: kind sniffing, chunk iteration, session assembly.

use crate::binary::{crc16_ccitt, crc32};
use crate::decoder::events::{decode_event_stream, EventStream, SizeTable};
use crate::decoder::header::{
    looks_like_chunk, parse_chunk_header, ChunkHeader, HeaderType, SUBTYPE_SETTINGS,
};
use crate::decoder::interval::decode_interval;
use crate::decoder::settings::decode_settings;
use crate::session::types::{EventKind, Session, WaveformChannel};
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Sync byte that opens every frame of a legacy frame stream.
const LEGACY_FRAME_SYNC: u8 = 0xA5;

/// EDF files open with the version field "0" padded to 8 bytes.
const EDF_VERSION_FIELD: &[u8; 8] = b"0       ";

/// Longest gap between waveform chunks that is bridged with zero flow.
/// Chunks starting further past the channel end are dropped.
const MAX_WAVEFORM_GAP_SECS: f64 = 12.0 * 3600.0;

/// Resolution of the event-stream clock; the last record covers one tick.
const EVENT_CLOCK_TICK_SECS: i64 = 1;

/// Format classification of a card file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Unknown,
    ChunkContainer,
    LegacyFrameStream,
    Edf,
}

/// Debug summary of the chunks walked in one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSummary {
    pub version: u8,
    pub family: u8,
    pub family_version: u8,
    pub chunks: usize,
    pub event_chunks: usize,
    pub interval_chunks: usize,
    pub settings_chunks: usize,
    pub crc_failures: usize,
    pub header_checksum_failures: usize,
    pub resyncs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_unknown_code: Option<u8>,
    pub truncated_streams: usize,
    pub skipped_fields: usize,
    /// A trailing chunk did not fit in the buffer and was dropped
    pub truncated_tail: bool,
}

/// Everything recovered from one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedFile {
    pub source: String,
    pub kind: FileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HeaderSummary>,
    pub sessions: Vec<Session>,
}

impl DecodedFile {
    fn empty(source: String, kind: FileKind, magic: Option<String>) -> Self {
        Self {
            source,
            kind,
            magic,
            header: None,
            sessions: Vec::new(),
        }
    }
}

/// Classify a buffer by its leading bytes and (for legacy streams) its name.
pub fn sniff_kind(bytes: &[u8], source: &str) -> FileKind {
    if looks_like_chunk(bytes) {
        FileKind::ChunkContainer
    } else if bytes.len() >= EDF_VERSION_FIELD.len() && bytes.starts_with(EDF_VERSION_FIELD) {
        FileKind::Edf
    } else if bytes.first() == Some(&LEGACY_FRAME_SYNC)
        && source.to_ascii_lowercase().ends_with(".000")
    {
        FileKind::LegacyFrameStream
    } else {
        FileKind::Unknown
    }
}

/// Decode one device file.
///
/// Never fails: unrecognized input yields [`FileKind::Unknown`] with no
/// sessions, and a malformed tail keeps every session assembled before it.
pub fn decode_file(bytes: &[u8], source: Option<&str>) -> DecodedFile {
    let source = source.unwrap_or("").to_string();
    let kind = sniff_kind(bytes, &source);

    match kind {
        FileKind::ChunkContainer => decode_chunks(bytes, source),
        FileKind::Edf => {
            debug!(%source, "EDF file recognized; signal data is not decoded");
            DecodedFile::empty(source, kind, Some("0".to_string()))
        }
        FileKind::LegacyFrameStream => {
            debug!(%source, "legacy frame stream recognized; frames are not decoded");
            DecodedFile::empty(source, kind, None)
        }
        FileKind::Unknown => {
            debug!(%source, len = bytes.len(), "unrecognized file");
            DecodedFile::empty(source, kind, None)
        }
    }
}

fn decode_chunks(bytes: &[u8], source: String) -> DecodedFile {
    let mut summary = HeaderSummary::default();
    let mut sessions: Vec<Session> = Vec::new();
    let mut by_id: HashMap<u32, usize> = HashMap::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let header = match parse_chunk_header(&bytes[offset..]) {
            Ok(header) => header,
            Err(e) => {
                debug!(%source, offset, error = %e, "stopping at malformed chunk");
                summary.truncated_tail = true;
                break;
            }
        };
        let chunk = &bytes[offset..offset + header.block_size];

        if summary.chunks == 0 {
            summary.version = header.version;
            summary.family = header.family;
            summary.family_version = header.family_version;
        }
        summary.chunks += 1;

        if !header.header_checksum_ok {
            summary.header_checksum_failures += 1;
            warn!(%source, offset, "chunk header checksum mismatch");
        }
        if !trailer_matches(chunk, &header) {
            summary.crc_failures += 1;
            warn!(%source, offset, version = header.version, "chunk CRC mismatch");
        }

        let idx = *by_id.entry(header.session_id).or_insert_with(|| {
            sessions.push(Session::new(
                header.session_id,
                unix_time(header.timestamp),
                source.clone(),
            ));
            sessions.len() - 1
        });
        apply_chunk(
            &mut sessions[idx],
            &header,
            &chunk[header.body_range()],
            &mut summary,
        );

        offset += header.block_size;
    }

    DecodedFile {
        source,
        kind: FileKind::ChunkContainer,
        magic: None,
        header: Some(summary),
        sessions,
    }
}

/// Fold one chunk into its session.
///
/// Session bounds follow the chunk clocks only: the chunk timestamp, the
/// event-stream clock, interval durations, and the waveform end. Records that
/// carry their own absolute time never move the bounds; aggregation drops them
/// when they fall outside the session.
fn apply_chunk(
    session: &mut Session,
    header: &ChunkHeader,
    body: &[u8],
    summary: &mut HeaderSummary,
) {
    let chunk_time = unix_time(header.timestamp);
    if chunk_time < session.start {
        session.start = chunk_time;
    }
    session.extend_to(chunk_time);

    match header.header_type {
        HeaderType::Event if header.ext == SUBTYPE_SETTINGS => {
            summary.settings_chunks += 1;
            if let Some(settings) = decode_settings(body) {
                session.settings = Some(settings);
            }
        }
        HeaderType::Event => {
            summary.event_chunks += 1;
            let table = if header.version >= 3 {
                SizeTable::from_header_data(&header.header_data)
            } else {
                SizeTable::defaults()
            };

            let stream = decode_event_stream(body, chunk_time, &table);
            match &stream {
                EventStream::Clean(_) => {}
                EventStream::PartialOk {
                    first_unknown_code,
                    resyncs,
                    ..
                } => {
                    summary.resyncs += resyncs;
                    summary.first_unknown_code.get_or_insert(*first_unknown_code);
                }
                EventStream::Truncated { .. } => summary.truncated_streams += 1,
            }

            let batch = stream.into_batch();
            summary.skipped_fields += batch.skipped_fields;

            // Backdated events may start before the chunk.
            let earliest = batch
                .events
                .iter()
                .filter(|e| e.kind != EventKind::SnoreAtPressure)
                .map(|e| e.timestamp)
                .min();
            if let Some(earliest) = earliest {
                session.start = session.start.min(earliest);
            }
            if batch.events.is_empty() && batch.samples.is_empty() {
                session.extend_to(batch.end_time);
            } else {
                session.extend_to(batch.end_time + Duration::seconds(EVENT_CLOCK_TICK_SECS));
            }

            session.events.extend(batch.events);
            session.signals.extend(batch.samples);
        }
        HeaderType::Interval => {
            summary.interval_chunks += 1;
            match decode_interval(body) {
                Ok(record) => {
                    let duration = record.duration_secs();
                    session.interval_secs += duration;
                    session.extend_to(chunk_time + Duration::seconds(duration as i64));

                    if let (Some(rate), Some(flow)) = (record.flow_sample_rate(), record.flow) {
                        append_waveform(session, chunk_time, rate, flow);
                        if let Some(end) = session.waveform.as_ref().map(WaveformChannel::end) {
                            session.extend_to(end);
                        }
                    }
                    if record.truncated {
                        summary.truncated_streams += 1;
                    }
                }
                Err(e) => {
                    debug!(session = session.session_id, error = %e, "unreadable interval chunk");
                    summary.truncated_streams += 1;
                }
            }
        }
    }
}

/// Place a chunk's flow samples on the session waveform at their own time.
///
/// Forward gaps are zero-filled up to [`MAX_WAVEFORM_GAP_SECS`]. Samples that
/// overlap what the channel already holds are skipped, so every sample keeps
/// the timestamp of its chunk.
fn append_waveform(session: &mut Session, at: DateTime<Utc>, rate: f64, samples: Vec<f32>) {
    if rate <= 0.0 || samples.is_empty() {
        return;
    }

    let Some(wave) = session.waveform.as_mut() else {
        session.waveform = Some(WaveformChannel::new(at, rate, samples));
        return;
    };

    if (wave.sample_rate - rate).abs() > 1e-6 {
        debug!(
            session = session.session_id,
            expected = wave.sample_rate,
            found = rate,
            "dropping waveform chunk with mismatched sample rate"
        );
        return;
    }

    let offset_secs = (at - wave.start).num_milliseconds() as f64 / 1000.0;
    if offset_secs < 0.0 {
        debug!(
            session = session.session_id,
            offset_secs, "dropping waveform chunk that starts before the channel"
        );
        return;
    }

    let first_index = (offset_secs * rate).round() as usize;
    let len = wave.samples.len();

    if first_index > len {
        let gap_secs = (first_index - len) as f64 / rate;
        if gap_secs > MAX_WAVEFORM_GAP_SECS {
            debug!(
                session = session.session_id,
                gap_secs, "dropping waveform chunk past the gap limit"
            );
            return;
        }
        wave.samples.resize(first_index, 0.0);
        wave.samples.extend(samples);
    } else {
        let overlap = len - first_index;
        if overlap > 0 {
            debug!(
                session = session.session_id,
                overlap, "skipping waveform samples already on the channel"
            );
        }
        wave.samples.extend(samples.into_iter().skip(overlap));
    }
}

fn trailer_matches(chunk: &[u8], header: &ChunkHeader) -> bool {
    let split = chunk.len() - header.trailer_len();
    let (covered, trailer) = chunk.split_at(split);
    if header.version >= 3 {
        crc32(covered) == LittleEndian::read_u32(trailer)
    } else {
        crc16_ccitt(covered) == LittleEndian::read_u16(trailer)
    }
}

fn unix_time(secs: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_default()
}
