//! Framing for WAL records.
//!
//! Each record is:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][JSON body: N bytes][crc32: 4 bytes LE]
//! ```
//!
//! Files start with [`MAGIC`] followed by the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current codec version.
pub const CODEC_VERSION: u8 = 1;

/// Identifies relay-history log files.
pub const MAGIC: [u8; 4] = *b"RLYH";

/// Upper bound for one record body; anything larger is treated as corruption.
const MAX_RECORD_SIZE: usize = 100 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

/// Serializes `value` into one framed record.
///
/// # Errors
///
/// Returns `InvalidData` if serialization fails or the body exceeds the
/// record size limit.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let body =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    if body.len() > MAX_RECORD_SIZE {
        return Err(invalid(format!(
            "record size {} exceeds maximum {MAX_RECORD_SIZE}",
            body.len()
        )));
    }
    let len = u32::try_from(body.len()).map_err(|_| invalid("record too large".to_string()))?;

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + body.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one framed record and verifies its checksum.
///
/// # Errors
///
/// Returns `UnexpectedEof` at a clean or torn end of input and `InvalidData`
/// for an unknown version, an oversized length, a checksum mismatch or an
/// undecodable body.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(invalid(format!(
            "record size {len} exceeds maximum {MAX_RECORD_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);
    let mut hasher = Hasher::new();
    hasher.update(&body);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&body).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
///
/// # Errors
///
/// Propagates I/O errors.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and validates the file header, returning the codec version.
///
/// # Errors
///
/// Returns `InvalidData` if the magic bytes do not match.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!(
            "invalid magic bytes: expected {MAGIC:?}, got {magic:?}"
        )));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    Ok(version[0])
}
