//! Low-level binary primitives shared by the chunk decoder.
//!
//! This module contains:
//! - The decode error raised on short or malformed input
//! - CRC16 (CCITT-FALSE) and CRC32 (IEEE) checksums used by chunk trailers
//!
//! Little-endian field reads go through `byteorder::ReadBytesExt` on a
//! `std::io::Cursor` over the chunk bytes.

pub mod crc;
pub mod error;

pub use crc::{crc16_ccitt, crc32, header_checksum};
pub use error::DecodeError;
