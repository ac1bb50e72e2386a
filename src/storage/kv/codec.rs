//! Framing for key-value store files.
//!
//! Every file starts with a header naming what it holds:
//! ```text
//! [MAGIC: 4 bytes "GNKV"][VERSION: 1 byte][KIND: 1 byte]
//! ```
//! followed by frames:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][data: N bytes JSON][crc32: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying key-value store files.
pub const MAGIC: [u8; 4] = *b"GNKV";

/// Header length in bytes.
pub const HEADER_LEN: u64 = 6;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// What a store file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Wal = 1,
    Snapshot = 2,
}

impl FileKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Wal),
            2 => Some(Self::Snapshot),
            _ => None,
        }
    }
}

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

/// Serializes `value` into one checksummed frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(data.len())
        .map_err(|_| invalid(format!("frame of {} bytes is too large", data.len())))?;

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one frame, verifying its checksum.
///
/// A frame cut short by a crash yields `ErrorKind::UnexpectedEof`.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported frame version: {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(invalid(format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}")));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed = hasher.finalize();
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&data).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write, kind: FileKind) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION, kind as u8])?;
    Ok(())
}

/// Reads the file header and checks it names `expected`.
pub fn read_header(reader: &mut impl Read, expected: FileKind) -> IoResult<()> {
    let mut header = [0u8; 6];
    reader.read_exact(&mut header)?;

    if header[..4] != MAGIC {
        return Err(invalid(format!("invalid magic bytes: {:?}", &header[..4])));
    }
    if header[4] != CODEC_VERSION {
        return Err(invalid(format!("unsupported file version: {}", header[4])));
    }
    match FileKind::from_byte(header[5]) {
        Some(kind) if kind == expected => Ok(()),
        other => Err(invalid(format!("expected a {expected:?} file, found {other:?}"))),
    }
}
