//! Best-effort extraction of device settings from settings chunks.
//!
//! Settings chunks are TLV records (`code u8`, `len u8`, `len` bytes). Only
//! the minimum-pressure estimate is recovered; everything else is skipped.

use crate::session::types::DeviceSettings;
use byteorder::ReadBytesExt;
use std::io::{Cursor, Read};

/// Setting codes that hold a single half-cmH2O pressure value.
const PRESSURE_SETTING_CODES: &[u8] = &[0x0A, 0x0B, 0x0C];

/// Plausible therapy pressures in half-cmH2O units (4..=20 cmH2O).
const MIN_PLAUSIBLE_HALF_CMH2O: u8 = 8;
const MAX_PLAUSIBLE_HALF_CMH2O: u8 = 40;

/// Scan a settings body for the lowest plausible pressure setting.
pub fn estimate_min_pressure(data: &[u8]) -> Option<f64> {
    let mut cursor = Cursor::new(data);
    let mut best: Option<u8> = None;

    while let (Ok(code), Ok(len)) = (cursor.read_u8(), cursor.read_u8()) {
        let mut value = vec![0u8; len as usize];
        if cursor.read_exact(&mut value).is_err() {
            break;
        }
        if len != 1 || !PRESSURE_SETTING_CODES.contains(&code) {
            continue;
        }
        let raw = value[0];
        if (MIN_PLAUSIBLE_HALF_CMH2O..=MAX_PLAUSIBLE_HALF_CMH2O).contains(&raw) {
            best = Some(best.map_or(raw, |b| b.min(raw)));
        }
    }

    best.map(|raw| raw as f64 / 2.0)
}

/// Decode the settings carried by a settings chunk body.
pub fn decode_settings(data: &[u8]) -> Option<DeviceSettings> {
    estimate_min_pressure(data).map(|min_pressure| DeviceSettings { min_pressure })
}
