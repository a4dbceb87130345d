//! End-to-end tests: synthetic card files through decode, merge, aggregate,
//! trends, and the waveform index.

use cpap_card_analytics::binary::{crc16_ccitt, crc32, header_checksum};
use cpap_card_analytics::decoder::{decode_file, FileKind};
use cpap_card_analytics::import::{run_pipeline, CardFile};
use cpap_card_analytics::session::{merge_sessions, EventKind, SignalType};
use cpap_card_analytics::{AggregatorConfig, Config};
use std::sync::atomic::AtomicBool;

/// 2024-03-01 22:00:00 UTC
const T0: u32 = 1_709_330_400;

const CODE_OBSTRUCTIVE_APNEA: u8 = 0x04;
const CODE_STATISTICS: u8 = 0x0E;

/// Build one chunk with a valid header checksum and trailer.
fn chunk(
    version: u8,
    header_type: u8,
    ext: u8,
    session_id: u32,
    timestamp: u32,
    table: &[(u8, u8)],
    body: &[u8],
) -> Vec<u8> {
    let header_data_len = if version == 3 { 2 + 2 * table.len() } else { 0 };
    let trailer_len = if version == 3 { 4 } else { 2 };
    let block_size = (15 + header_data_len + body.len() + trailer_len) as u16;

    let mut bytes = vec![version];
    bytes.extend_from_slice(&block_size.to_le_bytes());
    bytes.extend_from_slice(&[header_type, 0, 6, ext]);
    bytes.extend_from_slice(&session_id.to_le_bytes());
    bytes.extend_from_slice(&timestamp.to_le_bytes());
    if version == 3 {
        bytes.push(table.len() as u8);
        for &(code, size) in table {
            bytes.extend_from_slice(&[code, size]);
        }
        let checksum = header_checksum(&bytes);
        bytes.push(checksum);
    }
    bytes.extend_from_slice(body);
    if version == 3 {
        let crc = crc32(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
    } else {
        let crc = crc16_ccitt(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
    }
    bytes
}

/// Version-2 event chunk with `count` obstructive apneas `spacing` seconds apart.
fn apnea_chunk(session_id: u32, start: u32, count: usize, spacing: u16) -> Vec<u8> {
    let mut body = Vec::new();
    for _ in 0..count {
        body.push(CODE_OBSTRUCTIVE_APNEA);
        body.extend_from_slice(&spacing.to_le_bytes());
        body.push(10);
    }
    chunk(2, 0, 0x02, session_id, start, &[], &body)
}

/// Version-2 event chunk of statistics records carrying leak samples.
fn leak_chunk(session_id: u32, start: u32, leaks: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    for &leak in leaks {
        body.push(CODE_STATISTICS);
        body.extend_from_slice(&60u16.to_le_bytes());
        body.extend_from_slice(&[leak, 0, 1]);
    }
    chunk(2, 0, 0x02, session_id, start, &[], &body)
}

/// Interval chunk; with `flow_per_interval > 0` it embeds a sine flow waveform.
fn interval_chunk(
    session_id: u32,
    start: u32,
    intervals: u16,
    interval_secs: u8,
    flow_per_interval: u16,
) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&intervals.to_le_bytes());
    body.push(interval_secs);
    if flow_per_interval == 0 {
        body.push(0);
    } else {
        body.push(1);
        body.push(0);
        body.extend_from_slice(&flow_per_interval.to_le_bytes());
        let total = intervals as usize * flow_per_interval as usize;
        let rate = flow_per_interval as f64 / interval_secs as f64;
        for i in 0..total {
            let t = i as f64 / rate;
            let counts = (60.0 * (2.0 * std::f64::consts::PI * t / 4.0).sin()).round() as i8;
            body.push(counts as u8);
        }
    }
    chunk(2, 1, 0x05, session_id, start, &[], &body)
}

#[test]
fn test_scenario_header_with_unknown_trailing_byte() {
    let mut bytes = vec![
        0x03, 0x20, 0x00, 0x00, 0x00, 0x06, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    // Header data: one entry announcing a 3-byte obstructive-apnea payload.
    bytes.extend_from_slice(&[0x01, CODE_OBSTRUCTIVE_APNEA, 0x03]);
    let checksum = header_checksum(&bytes);
    bytes.push(checksum);
    // A recognized record followed by an unrecognized byte and padding.
    bytes.extend_from_slice(&[CODE_OBSTRUCTIVE_APNEA, 0x00, 0x00, 0x00]);
    bytes.extend_from_slice(&[0xEE, 0x00, 0x00, 0x00, 0x00]);
    let crc = crc32(&bytes);
    bytes.extend_from_slice(&crc.to_le_bytes());
    assert_eq!(bytes.len(), 32);

    let decoded = decode_file(&bytes, Some("00000001.001"));
    assert_eq!(decoded.kind, FileKind::ChunkContainer);
    assert_eq!(decoded.sessions.len(), 1);

    let session = &decoded.sessions[0];
    assert_eq!(session.session_id, 1);
    assert_eq!(session.events.len(), 1);
    assert_eq!(session.events[0].kind, EventKind::ObstructiveApnea);

    let header = decoded.header.unwrap();
    assert_eq!(header.first_unknown_code, Some(0xEE));
    assert_eq!(header.crc_failures, 0);
    assert_eq!(header.header_checksum_failures, 0);
}

#[test]
fn test_decoding_is_idempotent() {
    let mut bytes = apnea_chunk(7, T0, 4, 300);
    bytes.extend(leak_chunk(7, T0 + 1200, &[10, 20, 30]));
    bytes.extend(interval_chunk(7, T0, 20, 2, 50));

    let first = decode_file(&bytes, Some("00000007.001"));
    let second = decode_file(&bytes, Some("00000007.001"));
    assert_eq!(first, second);
    assert!(!first.sessions.is_empty());
}

#[test]
fn test_event_and_waveform_files_merge() {
    let events = decode_file(&leak_chunk(0x1A, T0, &[12, 14, 40, 13]), Some("0000001A.002"));
    let waveform = decode_file(&interval_chunk(0x1A, T0, 60, 2, 50), Some("0000001A.005"));

    assert!(events.sessions[0].has_signal(SignalType::Leak));
    assert!(events.sessions[0].waveform.is_none());
    assert!(waveform.sessions[0].waveform.is_some());

    let mut sessions = events.sessions;
    sessions.extend(waveform.sessions);
    let merged = merge_sessions(sessions);

    assert_eq!(merged.len(), 1);
    assert!(merged[0].has_signal(SignalType::Leak));
    let wave = merged[0].waveform.as_ref().unwrap();
    assert_eq!(wave.len(), 60 * 50);
    assert!((wave.sample_rate - 25.0).abs() < 1e-9);
}

fn card(files: Vec<(&str, Vec<u8>)>) -> Vec<CardFile> {
    files
        .into_iter()
        .map(|(name, bytes)| CardFile::new(name, bytes))
        .collect()
}

#[test]
fn test_one_hour_with_six_apneas() {
    let mut bytes = apnea_chunk(1, T0, 6, 500);
    bytes.extend(interval_chunk(1, T0, 60, 60, 0));
    let files = card(vec![("DATALOG/00000001.001", bytes)]);

    let cancel = AtomicBool::new(false);
    let output = run_pipeline(&files, &Config::default(), &cancel).unwrap();

    assert_eq!(output.days.len(), 1);
    let day = &output.days[0];
    assert_eq!(day.usage_secs, 3600.0);
    assert_eq!(day.count_of(EventKind::ObstructiveApnea), 6);
    assert!((day.ahi.unwrap() - 6.0).abs() < 1e-9);
    assert!(day.peak_rolling_ahi.unwrap() >= 6.0);
}

#[test]
fn test_full_card_pipeline() {
    let night_two = T0 + 86_400;
    let files = card(vec![
        ("DATALOG/0000001A.002", leak_chunk(0x1A, T0, &[12, 14, 40, 13, 12, 11])),
        ("DATALOG/0000001A.005", interval_chunk(0x1A, T0, 150, 2, 50)),
        ("DATALOG/0000001B.001", apnea_chunk(0x1B, night_two, 3, 600)),
        ("DATALOG/0000001B.002", interval_chunk(0x1B, night_two, 120, 60, 0)),
        ("STR.edf", b"0       header".to_vec()),
        ("notes.txt", b"not a card file".to_vec()),
    ]);

    let cancel = AtomicBool::new(false);
    let output = run_pipeline(&files, &Config::default(), &cancel).unwrap();

    assert_eq!(output.stats.files_seen, 6);
    assert_eq!(output.stats.files_decoded, 4);
    assert_eq!(output.stats.files_skipped, 1);
    assert_eq!(output.stats.files_unrecognized, 1);
    assert!(output.failures.is_empty());

    assert_eq!(output.sessions.len(), 2);
    assert_eq!(output.days.len(), 2);

    let first = &output.days[0];
    assert!(first.leak.threshold_from_data);
    assert!(first.leak.total.is_some());
    assert!(first.breaths.is_some());
    assert_eq!(first.ahi, Some(0.0));

    let second = &output.days[1];
    assert_eq!(second.usage_secs, 7200.0);
    assert!((second.ahi.unwrap() - 1.5).abs() < 1e-9);
    assert!(second.breaths.is_none());

    assert_eq!(output.weeks.len(), 1);
    assert_eq!(output.weeks[0].nights, 2);
    assert_eq!(output.months.len(), 1);

    let (start, end) = output.index.time_range(SignalType::Flow).unwrap();
    let points = output.index.query(SignalType::Flow, start, end + 1, 100);
    assert!(!points.is_empty() && points.len() <= 100);
    assert!(points.iter().all(|p| p.timestamp_ms >= start && p.timestamp_ms <= end));
}

#[test]
fn test_truncated_tail_keeps_earlier_chunks() {
    let mut bytes = apnea_chunk(3, T0, 2, 60);
    let second = apnea_chunk(3, T0 + 600, 2, 60);
    bytes.extend_from_slice(&second[..second.len() - 5]);

    let decoded = decode_file(&bytes, Some("00000003.001"));
    assert_eq!(decoded.kind, FileKind::ChunkContainer);
    assert_eq!(decoded.sessions.len(), 1);
    assert_eq!(decoded.sessions[0].events.len(), 2);
    assert!(decoded.header.unwrap().truncated_tail);
}

#[test]
fn test_timezone_changes_night_assignment() {
    // 22:00 UTC on 2024-03-01 is already 2024-03-02 in Auckland.
    let mut bytes = apnea_chunk(9, T0, 1, 60);
    bytes.extend(interval_chunk(9, T0, 10, 60, 0));
    let files = card(vec![("00000009.001", bytes)]);

    let mut config = Config::default();
    config.aggregator = AggregatorConfig::default()
        .with_timezone("Pacific/Auckland")
        .unwrap();

    let cancel = AtomicBool::new(false);
    let output = run_pipeline(&files, &config, &cancel).unwrap();
    assert_eq!(output.days[0].date.to_string(), "2024-03-02");
}

fn run(files: Vec<(&str, Vec<u8>)>) -> cpap_card_analytics::PipelineOutput {
    let cancel = AtomicBool::new(false);
    run_pipeline(&card(files), &Config::default(), &cancel).unwrap()
}

#[test]
fn test_absolute_time_record_stays_out_of_nightly_usage() {
    // Apnea reported an hour in, plus a snore summary stamped 30 days earlier.
    let mut body = vec![CODE_OBSTRUCTIVE_APNEA];
    body.extend_from_slice(&3600u16.to_le_bytes());
    body.push(10);
    body.push(0x0F);
    body.extend_from_slice(&(T0 - 30 * 86_400).to_le_bytes());
    body.extend_from_slice(&[20, 3]);
    let output = run(vec![("00000021.002", chunk(2, 0, 0x02, 0x21, T0, &[], &body))]);

    assert_eq!(output.days.len(), 1);
    let day = &output.days[0];
    assert_eq!(day.date.to_string(), "2024-03-01");
    assert_eq!(day.usage_secs, 3601.0);
    assert!((day.ahi.unwrap() - 1.0).abs() < 1e-3);
    assert_eq!(day.count_of(EventKind::SnoreAtPressure), 0);
}

#[test]
fn test_waveform_after_gap_lands_at_its_own_time() {
    let mut bytes = interval_chunk(0x22, T0, 30, 2, 50);
    bytes.extend(interval_chunk(0x22, T0 + 3600, 30, 2, 50));
    let output = run(vec![("00000022.005", bytes)]);

    let day = &output.days[0];
    assert_eq!(day.usage_secs, 3660.0);

    let (start, end) = output.index.time_range(SignalType::Flow).unwrap();
    assert_eq!(start, T0 as i64 * 1000);
    assert!(end > (T0 as i64 + 3659) * 1000 && end < (T0 as i64 + 3660) * 1000);

    // The bridged hour is flat; the second chunk's breathing shows up after it.
    let gap = output.index.query(
        SignalType::Flow,
        (T0 as i64 + 120) * 1000,
        (T0 as i64 + 3590) * 1000,
        50,
    );
    assert!(gap.iter().all(|p| p.min == 0.0 && p.max == 0.0));
    let second = output.index.query(
        SignalType::Flow,
        (T0 as i64 + 3600) * 1000,
        (T0 as i64 + 3660) * 1000,
        50,
    );
    assert!(second.iter().any(|p| p.max > 20.0));
}

#[test]
fn test_last_leak_sample_is_counted() {
    let output = run(vec![("00000023.002", leak_chunk(0x23, T0, &[10, 20, 30]))]);

    let day = &output.days[0];
    let leak: Vec<_> = day
        .signals
        .iter()
        .filter(|s| s.signal == SignalType::Leak)
        .collect();
    assert_eq!(leak.len(), 3);
    assert_eq!(day.leak.total.unwrap().max, 30.0);
}

#[test]
fn test_v2_file_with_crc16_mismatch_still_imports() {
    let mut bytes = apnea_chunk(0x24, T0, 2, 60);
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    bytes.extend(apnea_chunk(0x24, T0 + 600, 1, 60));
    let output = run(vec![("00000024.002", bytes)]);

    assert_eq!(output.stats.files_decoded, 1);
    assert_eq!(output.stats.checksum_failures, 1);
    assert_eq!(output.sessions.len(), 1);
    assert_eq!(output.days[0].count_of(EventKind::ObstructiveApnea), 3);
}
