//! Errors raised while reading raw device bytes.

use std::io::Cursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before `field` could be read.
    UnexpectedEof { field: &'static str, offset: u64 },
    /// A chunk header failed validation.
    InvalidHeader(String),
}

impl DecodeError {
    /// Short read of `field` at the cursor's current position.
    pub fn eof(field: &'static str, cursor: &Cursor<&[u8]>) -> Self {
        DecodeError::UnexpectedEof {
            field,
            offset: cursor.position(),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnexpectedEof { field, offset } => {
                write!(f, "Unexpected end of data reading {field} at offset {offset}")
            }
            DecodeError::InvalidHeader(e) => write!(f, "Invalid chunk header: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {}
