//! Event-stream decoding for event chunks.
//!
//! An event stream is a run of `(code, payload)` records. The payload size of
//! each code comes from the chunk's header-data block (version 3) or from the
//! built-in table (version 2). Every payload except the snore-at-pressure
//! summary starts with a 2-byte delta time that advances the stream clock.

use crate::session::types::{Event, EventKind, SignalSample, SignalType};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::io::Cursor;
use tracing::debug;

/// How far past an unknown code the decoder scans for a known one.
pub const RESYNC_WINDOW: usize = 16;

pub const CODE_PRESSURE_CHANGE: u8 = 0x01;
pub const CODE_PRESSURE_PULSE: u8 = 0x02;
pub const CODE_RERA: u8 = 0x03;
pub const CODE_OBSTRUCTIVE_APNEA: u8 = 0x04;
pub const CODE_CENTRAL_APNEA: u8 = 0x05;
pub const CODE_HYPOPNEA: u8 = 0x06;
pub const CODE_HYPOPNEA_VARIANT: u8 = 0x07;
pub const CODE_FLOW_LIMITATION: u8 = 0x08;
pub const CODE_VIBRATORY_SNORE: u8 = 0x09;
pub const CODE_VIBRATORY_SNORE_VARIANT: u8 = 0x0A;
pub const CODE_PERIODIC_BREATHING: u8 = 0x0B;
pub const CODE_LARGE_LEAK: u8 = 0x0C;
pub const CODE_VARIABLE_BREATHING: u8 = 0x0D;
pub const CODE_STATISTICS: u8 = 0x0E;
pub const CODE_SNORE_AT_PRESSURE: u8 = 0x0F;
pub const CODE_BREATH_NOT_DETECTED: u8 = 0x10;
pub const CODE_FLOW_SAMPLE: u8 = 0x11;

/// Built-in payload sizes (delta time included) for version-2 chunks.
const DEFAULT_SIZES: &[(u8, u8)] = &[
    (CODE_PRESSURE_CHANGE, 4),
    (CODE_PRESSURE_PULSE, 3),
    (CODE_RERA, 3),
    (CODE_OBSTRUCTIVE_APNEA, 3),
    (CODE_CENTRAL_APNEA, 3),
    (CODE_HYPOPNEA, 3),
    (CODE_HYPOPNEA_VARIANT, 4),
    (CODE_FLOW_LIMITATION, 3),
    (CODE_VIBRATORY_SNORE, 2),
    (CODE_VIBRATORY_SNORE_VARIANT, 3),
    (CODE_PERIODIC_BREATHING, 4),
    (CODE_LARGE_LEAK, 4),
    (CODE_VARIABLE_BREATHING, 4),
    (CODE_STATISTICS, 5),
    (CODE_SNORE_AT_PRESSURE, 6),
    (CODE_BREATH_NOT_DETECTED, 4),
    (CODE_FLOW_SAMPLE, 4),
];

/// Maps a record code to its encoded payload size.
#[derive(Debug, Clone)]
pub struct SizeTable {
    sizes: [Option<u8>; 256],
}

impl SizeTable {
    /// Table used when the chunk carries no header data.
    pub fn defaults() -> Self {
        Self::from_pairs(DEFAULT_SIZES)
    }

    /// Table announced by a version-3 header-data block.
    pub fn from_header_data(pairs: &[(u8, u8)]) -> Self {
        Self::from_pairs(pairs)
    }

    fn from_pairs(pairs: &[(u8, u8)]) -> Self {
        let mut sizes = [None; 256];
        for &(code, size) in pairs {
            sizes[code as usize] = Some(size);
        }
        Self { sizes }
    }

    pub fn size(&self, code: u8) -> Option<usize> {
        self.sizes[code as usize].map(usize::from)
    }

    pub fn contains(&self, code: u8) -> bool {
        self.sizes[code as usize].is_some()
    }
}

/// Events and samples decoded from one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub samples: Vec<SignalSample>,
    /// Records whose size was known but whose meaning is not
    pub skipped_fields: usize,
    /// Stream clock after the last decoded record
    pub end_time: DateTime<Utc>,
}

impl EventBatch {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            events: Vec::new(),
            samples: Vec::new(),
            skipped_fields: 0,
            end_time: start,
        }
    }
}

/// Result of walking an event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStream {
    /// Every byte was consumed by known records.
    Clean(EventBatch),
    /// At least one unknown code was skipped by resynchronizing.
    PartialOk {
        batch: EventBatch,
        first_unknown_code: u8,
        resyncs: usize,
    },
    /// A known record ran past the end of the stream.
    Truncated { batch: EventBatch, offset: usize },
}

impl EventStream {
    pub fn batch(&self) -> &EventBatch {
        match self {
            EventStream::Clean(batch) => batch,
            EventStream::PartialOk { batch, .. } => batch,
            EventStream::Truncated { batch, .. } => batch,
        }
    }

    pub fn into_batch(self) -> EventBatch {
        match self {
            EventStream::Clean(batch) => batch,
            EventStream::PartialOk { batch, .. } => batch,
            EventStream::Truncated { batch, .. } => batch,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, EventStream::Clean(_))
    }
}

/// Walk an event stream starting at `start`.
///
/// Unknown codes never abort the stream: the decoder scans up to
/// [`RESYNC_WINDOW`] bytes ahead for the next known code and continues there,
/// or ends the stream if none is found.
pub fn decode_event_stream(data: &[u8], start: DateTime<Utc>, table: &SizeTable) -> EventStream {
    let mut batch = EventBatch::new(start);
    let mut clock = start;
    let mut pos = 0;
    let mut first_unknown: Option<u8> = None;
    let mut resyncs = 0;

    while pos < data.len() {
        let code = data[pos];

        let Some(size) = table.size(code) else {
            first_unknown.get_or_insert(code);
            resyncs += 1;

            let window_end = (pos + 1 + RESYNC_WINDOW).min(data.len());
            match (pos + 1..window_end).find(|&i| table.contains(data[i])) {
                Some(next) => {
                    debug!(code, offset = pos, skipped = next - pos, "resynced event stream");
                    pos = next;
                    continue;
                }
                None => {
                    debug!(code, offset = pos, "no known code within resync window");
                    break;
                }
            }
        };

        let payload_start = pos + 1;
        let payload_end = payload_start + size;
        if payload_end > data.len() {
            batch.end_time = clock;
            return EventStream::Truncated { batch, offset: pos };
        }

        decode_record(code, &data[payload_start..payload_end], &mut clock, &mut batch);
        pos = payload_end;
    }

    batch.end_time = clock;
    match first_unknown {
        Some(first_unknown_code) => EventStream::PartialOk {
            batch,
            first_unknown_code,
            resyncs,
        },
        None => EventStream::Clean(batch),
    }
}

fn decode_record(code: u8, payload: &[u8], clock: &mut DateTime<Utc>, batch: &mut EventBatch) {
    let mut rd = Cursor::new(payload);

    if code != CODE_SNORE_AT_PRESSURE {
        let delta = rd.read_u16::<LittleEndian>().unwrap_or(0);
        *clock += Duration::seconds(delta as i64);
    }
    let now = *clock;

    match code {
        CODE_PRESSURE_CHANGE => {
            let pressure = rd.read_u8().map(tenths).ok();
            let exhale = rd.read_u8().map(tenths).ok();
            let mut event = Event::new(now, EventKind::PressureChange, pressure);
            if let Some(exhale) = exhale {
                event = event.with_metadata("exhale_pressure", format!("{exhale:.1}"));
                batch
                    .samples
                    .push(SignalSample::new(now, exhale, SignalType::ExhalePressure));
            }
            if let Some(pressure) = pressure {
                batch
                    .samples
                    .push(SignalSample::new(now, pressure, SignalType::Pressure));
            }
            batch.events.push(event);
        }
        CODE_PRESSURE_PULSE => {
            let pressure = rd.read_u8().map(tenths).ok();
            batch
                .events
                .push(Event::new(now, EventKind::PressurePulse, pressure));
        }
        CODE_RERA | CODE_OBSTRUCTIVE_APNEA | CODE_CENTRAL_APNEA | CODE_HYPOPNEA
        | CODE_FLOW_LIMITATION => {
            let kind = match code {
                CODE_RERA => EventKind::Rera,
                CODE_OBSTRUCTIVE_APNEA => EventKind::ObstructiveApnea,
                CODE_CENTRAL_APNEA => EventKind::CentralApnea,
                CODE_HYPOPNEA => EventKind::Hypopnea,
                _ => EventKind::FlowLimitation,
            };
            let elapsed = rd.read_u8().ok().map(f64::from);
            batch.events.push(backdated(now, kind, elapsed, elapsed));
        }
        CODE_HYPOPNEA_VARIANT => {
            let duration = rd.read_u8().ok().map(f64::from);
            let elapsed = rd.read_u8().ok().map(f64::from);
            batch.events.push(backdated(
                now,
                EventKind::HypopneaVariant,
                elapsed,
                duration,
            ));
        }
        CODE_VIBRATORY_SNORE => {
            batch
                .events
                .push(Event::new(now, EventKind::VibratorySnore, Some(1.0)));
        }
        CODE_VIBRATORY_SNORE_VARIANT => {
            let count = rd.read_u8().ok().map(f64::from);
            batch
                .events
                .push(Event::new(now, EventKind::VibratorySnoreVariant, count));
        }
        CODE_PERIODIC_BREATHING | CODE_LARGE_LEAK | CODE_VARIABLE_BREATHING
        | CODE_BREATH_NOT_DETECTED => {
            let kind = match code {
                CODE_PERIODIC_BREATHING => EventKind::PeriodicBreathing,
                CODE_LARGE_LEAK => EventKind::LargeLeak,
                CODE_VARIABLE_BREATHING => EventKind::VariableBreathing,
                _ => EventKind::BreathNotDetected,
            };
            let duration = rd.read_u16::<LittleEndian>().ok().map(f64::from);
            batch.events.push(backdated(now, kind, duration, duration));
        }
        CODE_STATISTICS => {
            if let Ok(leak) = rd.read_u8() {
                batch
                    .samples
                    .push(SignalSample::new(now, leak as f64, SignalType::Leak));
            }
            let _snore_count = rd.read_u8();
            if let Ok(flex) = rd.read_u8() {
                let active = if flex != 0 { 1.0 } else { 0.0 };
                batch
                    .samples
                    .push(SignalSample::new(now, active, SignalType::FlexActive));
            }
        }
        CODE_SNORE_AT_PRESSURE => {
            let Ok(absolute) = rd.read_u32::<LittleEndian>() else {
                batch.skipped_fields += 1;
                return;
            };
            let at = Utc
                .timestamp_opt(absolute as i64, 0)
                .single()
                .unwrap_or(now);
            let pressure = rd.read_u8().ok().map(|p| p as f64 / 2.0);
            let count = rd.read_u8().ok().map(f64::from);
            let mut event = Event::new(at, EventKind::SnoreAtPressure, count);
            if let Some(pressure) = pressure {
                event = event.with_metadata("pressure", format!("{pressure:.1}"));
            }
            batch.events.push(event);
        }
        CODE_FLOW_SAMPLE => {
            if let Ok(raw) = rd.read_i16::<LittleEndian>() {
                batch
                    .samples
                    .push(SignalSample::new(now, raw as f64 / 10.0, SignalType::Flow));
            }
        }
        _ => batch.skipped_fields += 1,
    }
}

/// An event reported `elapsed` seconds after it started.
fn backdated(
    now: DateTime<Utc>,
    kind: EventKind,
    elapsed: Option<f64>,
    value: Option<f64>,
) -> Event {
    let at = match elapsed {
        Some(secs) => now - Duration::seconds(secs as i64),
        None => now,
    };
    Event::new(at, kind, value)
}

fn tenths(raw: u8) -> f64 {
    raw as f64 / 10.0
}
