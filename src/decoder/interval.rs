//! Interval/waveform chunk payloads.
//!
//! ```text
//! interval_count       u16
//! interval_secs        u8
//! signal_count         u8
//! signal_count x { signal_type u8, samples_per_interval u16 }
//! interval_count x signal_count x samples_per_interval x i8   (interleaved)
//! ```

use crate::binary::DecodeError;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};

/// Descriptor signal type for patient flow.
pub const WAVEFORM_SIGNAL_FLOW: u8 = 0;

/// Litres per minute represented by one raw flow count.
pub const FLOW_LPM_PER_COUNT: f32 = 0.5;

/// One signal announced by an interval chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalDescriptor {
    pub signal_type: u8,
    pub samples_per_interval: u16,
}

/// Decoded contents of one interval chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalRecord {
    pub interval_count: u16,
    pub interval_secs: u8,
    pub descriptors: Vec<SignalDescriptor>,
    /// Flow samples in L/min, present when the chunk embeds a flow waveform
    pub flow: Option<Vec<f32>>,
    /// Set when sample data ended before every interval was read
    pub truncated: bool,
}

impl IntervalRecord {
    /// Seconds of therapy covered by this chunk.
    pub fn duration_secs(&self) -> u64 {
        self.interval_count as u64 * self.interval_secs as u64
    }

    /// Flow samples per second, if the chunk embeds flow.
    pub fn flow_sample_rate(&self) -> Option<f64> {
        if self.interval_secs == 0 {
            return None;
        }
        self.descriptors
            .iter()
            .find(|d| d.signal_type == WAVEFORM_SIGNAL_FLOW)
            .map(|d| d.samples_per_interval as f64 / self.interval_secs as f64)
    }
}

/// Parse an interval chunk body.
///
/// The fixed fields and descriptor list must be complete; sample data that
/// runs short keeps every fully read sample and sets `truncated`.
pub fn decode_interval(data: &[u8]) -> Result<IntervalRecord, DecodeError> {
    let mut cursor = Cursor::new(data);
    let interval_count = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| DecodeError::eof("interval count", &cursor))?;
    let interval_secs = cursor
        .read_u8()
        .map_err(|_| DecodeError::eof("interval seconds", &cursor))?;
    let signal_count = cursor
        .read_u8()
        .map_err(|_| DecodeError::eof("signal count", &cursor))? as usize;

    let mut descriptors = Vec::with_capacity(signal_count);
    for _ in 0..signal_count {
        let signal_type = cursor
            .read_u8()
            .map_err(|_| DecodeError::eof("signal type", &cursor))?;
        let samples_per_interval = cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| DecodeError::eof("samples per interval", &cursor))?;
        descriptors.push(SignalDescriptor {
            signal_type,
            samples_per_interval,
        });
    }

    let flow_slot = descriptors
        .iter()
        .position(|d| d.signal_type == WAVEFORM_SIGNAL_FLOW);

    let mut flow = flow_slot.map(|slot| {
        let per_interval = descriptors[slot].samples_per_interval as usize;
        Vec::with_capacity(interval_count as usize * per_interval)
    });
    let mut truncated = false;
    let mut raw = Vec::new();

    if !descriptors.is_empty() {
        'intervals: for _ in 0..interval_count {
            for (slot, descriptor) in descriptors.iter().enumerate() {
                raw.resize(descriptor.samples_per_interval as usize, 0);
                if cursor.read_exact(&mut raw).is_err() {
                    truncated = true;
                    break 'intervals;
                }
                if Some(slot) == flow_slot {
                    if let Some(flow) = flow.as_mut() {
                        flow.extend(raw.iter().map(|&b| (b as i8) as f32 * FLOW_LPM_PER_COUNT));
                    }
                }
            }
        }
    }

    Ok(IntervalRecord {
        interval_count,
        interval_secs,
        descriptors,
        flow,
        truncated,
    })
}
