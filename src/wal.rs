//! Log segment files: naming, framing, and whole-file I/O
//!
//! A flushed segment is one file named `SSSSSSSSSSSS_EEEEEEEEEEEE.log`
//! (zero-padded decimal start and end LSN, inclusive) holding that LSN range.
//!
//! ## Segment format
//!
//! Binary-encoded (bincode), little-endian framing:
//! - 4-byte record count
//! - per record: 4-byte length prefix, then the serialized [`LogRecord`]
//!
//! Files are written whole, to a temp file first and renamed into place, and
//! are never rewritten or truncated afterwards.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{KeystoneError, Result};
use crate::log::LogRecord;
use crate::types::Lsn;

const SEGMENT_SUFFIX: &str = ".log";
const LSN_FIELD_WIDTH: usize = 12;

/// Format the file name for the inclusive LSN range `[start_lsn, end_lsn]`
pub fn segment_file_name(start_lsn: Lsn, end_lsn: Lsn) -> String {
    format!("{:012}_{:012}{}", start_lsn, end_lsn, SEGMENT_SUFFIX)
}

/// Parse a segment file name back into its `(start_lsn, end_lsn)` range.
/// Returns `None` for anything that does not match the exact format.
pub fn parse_segment_file_name(name: &str) -> Option<(Lsn, Lsn)> {
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    let (start, end) = stem.split_once('_')?;
    if start.len() != LSN_FIELD_WIDTH || end.len() != LSN_FIELD_WIDTH {
        return None;
    }
    if !start.bytes().all(|b| b.is_ascii_digit()) || !end.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Serialize a record range into the segment wire format
pub fn encode_segment(records: &[LogRecord]) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        let encoded = bincode::serialize(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        buf.extend_from_slice(&encoded);
    }
    Ok(buf)
}

/// Decode a segment file's bytes. `name` is used in corruption reports.
pub fn decode_segment(bytes: &[u8], name: &str) -> Result<Vec<LogRecord>> {
    let mut pos = 0usize;
    let count = read_u32(bytes, &mut pos, name)? as usize;
    let mut records = Vec::new();
    for _ in 0..count {
        let len = read_u32(bytes, &mut pos, name)? as usize;
        if bytes.len() - pos < len {
            return Err(KeystoneError::corrupt(name, "truncated record"));
        }
        let record: LogRecord = bincode::deserialize(&bytes[pos..pos + len])
            .map_err(|e| KeystoneError::corrupt(name, format!("malformed record: {}", e)))?;
        pos += len;
        records.push(record);
    }
    if pos != bytes.len() {
        return Err(KeystoneError::corrupt(name, "trailing bytes after last record"));
    }
    Ok(records)
}

fn read_u32(bytes: &[u8], pos: &mut usize, name: &str) -> Result<u32> {
    if bytes.len() - *pos < 4 {
        return Err(KeystoneError::corrupt(name, "truncated length prefix"));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[*pos..*pos + 4]);
    *pos += 4;
    Ok(u32::from_le_bytes(buf))
}

/// Write `records` as the segment `[start_lsn, end_lsn]` under `dir`.
///
/// The file appears atomically: contents go to a temp file in the same
/// directory, are fsynced, and the temp file is renamed over the final name.
pub fn write_segment(
    dir: &Path,
    start_lsn: Lsn,
    end_lsn: Lsn,
    records: &[LogRecord],
) -> Result<PathBuf> {
    let name = segment_file_name(start_lsn, end_lsn);
    let path = dir.join(&name);
    let bytes = encode_segment(records).map_err(|e| KeystoneError::io(&path, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| KeystoneError::io(dir, e))?;
    tmp.write_all(&bytes).map_err(|e| KeystoneError::io(&path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| KeystoneError::io(&path, e))?;
    tmp.persist(&path)
        .map_err(|e| KeystoneError::io(&path, e.error))?;
    Ok(path)
}

/// Read a whole segment file back into records
pub fn read_segment(path: &Path) -> Result<Vec<LogRecord>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let bytes = fs::read(path).map_err(|e| KeystoneError::io(path, e))?;
    decode_segment(&bytes, &name)
}
