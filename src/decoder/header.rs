//! Fixed chunk header and the version-3 header-data block.
//!
//! Layout (little-endian):
//!
//! ```text
//! 0x00 version        u8   (2 or 3)
//! 0x01 block_size     u16  (whole chunk, trailer included)
//! 0x03 header_type    u8   (0 = events, 1 = interval/waveform)
//! 0x04 family         u8
//! 0x05 family_version u8
//! 0x06 ext            u8   (sub-type)
//! 0x07 session_id     u32
//! 0x0B timestamp      u32  (Unix seconds)
//! v3 only: count u8, count x (code u8, size u8), checksum u8
//! ```

use crate::binary::{header_checksum, DecodeError};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Size of the fixed part of every chunk header.
pub const CHUNK_HEADER_LEN: usize = 15;

/// Smallest block size a well-formed chunk can declare.
pub const MIN_BLOCK_SIZE: usize = 16;

/// Sub-type carried by settings chunks.
pub const SUBTYPE_SETTINGS: u8 = 0x01;
/// Sub-type carried by event chunks.
pub const SUBTYPE_EVENTS: u8 = 0x02;
/// Sub-type carried by waveform chunks.
pub const SUBTYPE_WAVEFORM: u8 = 0x05;

/// Record layout announced by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderType {
    Event,
    Interval,
}

impl HeaderType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(HeaderType::Event),
            1 => Some(HeaderType::Interval),
            _ => None,
        }
    }
}

/// A parsed chunk header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u8,
    pub block_size: usize,
    pub header_type: HeaderType,
    pub family: u8,
    pub family_version: u8,
    pub ext: u8,
    pub session_id: u32,
    pub timestamp: u32,
    /// (code, encoded size) pairs from the version-3 header-data block
    pub header_data: Vec<(u8, u8)>,
    /// Bytes consumed by the header, header data, and header checksum
    pub header_len: usize,
    pub header_checksum_ok: bool,
}

impl ChunkHeader {
    /// Length of the trailing checksum for this chunk's version.
    pub fn trailer_len(&self) -> usize {
        trailer_len(self.version)
    }

    /// Byte range of the record payload within the chunk.
    pub fn body_range(&self) -> std::ops::Range<usize> {
        self.header_len..self.block_size - self.trailer_len()
    }
}

/// CRC16 trailer for version 2, CRC32 for version 3.
pub fn trailer_len(version: u8) -> usize {
    if version >= 3 {
        4
    } else {
        2
    }
}

/// Check the leading bytes of `data` against the chunk-container rules.
///
/// `data` starts at the chunk; its length is the remaining buffer length.
pub fn looks_like_chunk(data: &[u8]) -> bool {
    validate_fixed(data).is_ok()
}

fn validate_fixed(data: &[u8]) -> Result<(u8, usize, HeaderType), DecodeError> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(DecodeError::UnexpectedEof {
            field: "chunk header",
            offset: data.len() as u64,
        });
    }

    let version = data[0];
    if version != 2 && version != 3 {
        return Err(DecodeError::InvalidHeader(format!(
            "unsupported version {version}"
        )));
    }

    let block_size = LittleEndian::read_u16(&data[1..3]) as usize;
    if block_size < MIN_BLOCK_SIZE || block_size > data.len() {
        return Err(DecodeError::InvalidHeader(format!(
            "block size {block_size} outside 16..={}",
            data.len()
        )));
    }

    let header_type = HeaderType::from_byte(data[3]).ok_or_else(|| {
        DecodeError::InvalidHeader(format!("unknown header type {}", data[3]))
    })?;

    Ok((version, block_size, header_type))
}

/// Parse the header of the chunk starting at `data[0]`.
pub fn parse_chunk_header(data: &[u8]) -> Result<ChunkHeader, DecodeError> {
    let (version, block_size, header_type) = validate_fixed(data)?;
    let chunk = &data[..block_size];

    let mut cursor = Cursor::new(chunk);
    cursor.set_position(4);
    let family = cursor
        .read_u8()
        .map_err(|_| DecodeError::eof("family", &cursor))?;
    let family_version = cursor
        .read_u8()
        .map_err(|_| DecodeError::eof("family version", &cursor))?;
    let ext = cursor
        .read_u8()
        .map_err(|_| DecodeError::eof("ext", &cursor))?;
    let session_id = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| DecodeError::eof("session id", &cursor))?;
    let timestamp = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| DecodeError::eof("timestamp", &cursor))?;

    let mut header_data = Vec::new();
    let mut header_checksum_ok = true;

    if version == 3 {
        let count = cursor
            .read_u8()
            .map_err(|_| DecodeError::eof("header data count", &cursor))? as usize;
        header_data.reserve(count);
        for _ in 0..count {
            let code = cursor
                .read_u8()
                .map_err(|_| DecodeError::eof("header data code", &cursor))?;
            let size = cursor
                .read_u8()
                .map_err(|_| DecodeError::eof("header data size", &cursor))?;
            header_data.push((code, size));
        }
        let expected = header_checksum(&chunk[..cursor.position() as usize]);
        let stored = cursor
            .read_u8()
            .map_err(|_| DecodeError::eof("header checksum", &cursor))?;
        header_checksum_ok = expected == stored;
    }

    let header_len = cursor.position() as usize;
    if header_len + trailer_len(version) > block_size {
        return Err(DecodeError::InvalidHeader(format!(
            "header of {header_len} bytes does not fit block of {block_size}"
        )));
    }

    Ok(ChunkHeader {
        version,
        block_size,
        header_type,
        family,
        family_version,
        ext,
        session_id,
        timestamp,
        header_data,
        header_len,
        header_checksum_ok,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_HEADER: [u8; 15] = [
        0x03, 0x20, 0x00, 0x00, 0x00, 0x06, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];

    fn v3_chunk() -> Vec<u8> {
        let mut bytes = SCENARIO_HEADER.to_vec();
        bytes.extend_from_slice(&[0x01, 0x04, 0x03]);
        let checksum = header_checksum(&bytes);
        bytes.push(checksum);
        bytes.resize(32, 0);
        bytes
    }

    #[test]
    fn test_parse_v3_header() {
        let bytes = v3_chunk();
        let header = parse_chunk_header(&bytes).unwrap();

        assert_eq!(header.version, 3);
        assert_eq!(header.block_size, 32);
        assert_eq!(header.header_type, HeaderType::Event);
        assert_eq!(header.family, 0);
        assert_eq!(header.family_version, 6);
        assert_eq!(header.ext, SUBTYPE_EVENTS);
        assert_eq!(header.session_id, 1);
        assert_eq!(header.timestamp, 0);
        assert_eq!(header.header_data, vec![(0x04, 0x03)]);
        assert_eq!(header.header_len, 19);
        assert!(header.header_checksum_ok);
        assert_eq!(header.body_range(), 19..28);
    }

    #[test]
    fn test_bad_header_checksum_is_reported_not_fatal() {
        let mut bytes = v3_chunk();
        bytes[18] ^= 0xFF;
        let header = parse_chunk_header(&bytes).unwrap();
        assert!(!header.header_checksum_ok);
    }

    #[test]
    fn test_rejects_invalid_leading_bytes() {
        let mut bytes = v3_chunk();
        bytes[0] = 4;
        assert!(!looks_like_chunk(&bytes));

        let mut bytes = v3_chunk();
        bytes[3] = 2;
        assert!(!looks_like_chunk(&bytes));

        // Block size larger than the remaining buffer.
        let bytes = v3_chunk();
        assert!(!looks_like_chunk(&bytes[..31]));

        let mut bytes = v3_chunk();
        bytes[1] = 15;
        assert!(!looks_like_chunk(&bytes));
    }

    #[test]
    fn test_header_data_past_block_is_an_error() {
        // Count announces 8 pairs but the block ends after the fixed header.
        let mut bytes = SCENARIO_HEADER.to_vec();
        bytes[1] = 18;
        bytes.extend_from_slice(&[0x08, 0x04, 0x03]);

        let err = parse_chunk_header(&bytes).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }

    #[test]
    fn test_v2_has_no_header_data() {
        let mut bytes = vec![0x02, 0x14, 0x00, 0x00, 0x00, 0x06, 0x02];
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&100u32.to_le_bytes());
        bytes.resize(20, 0);

        let header = parse_chunk_header(&bytes).unwrap();
        assert_eq!(header.header_len, CHUNK_HEADER_LEN);
        assert!(header.header_data.is_empty());
        assert_eq!(header.trailer_len(), 2);
        assert_eq!(header.session_id, 7);
        assert_eq!(header.timestamp, 100);
    }
}
