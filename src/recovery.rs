//! Startup replay of persisted log segments

use std::fs;
use std::path::PathBuf;

use log::{debug, info};

use crate::error::{KeystoneError, Result};
use crate::log::LogRecord;
use crate::types::Lsn;
use crate::wal;

/// Rebuilds the in-memory log from the segment files in a directory.
///
/// Only the log itself is rebuilt: the store map is not replayed and starts
/// empty, exactly as if the process had been started against a fresh log with
/// the same tail. Recovery is a pure function of the on-disk segments.
pub struct RecoveryManager {
    log_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Load every segment in ascending start-LSN order and reassemble the
    /// record sequence, enforcing that segments chain contiguously from LSN 0.
    pub fn recover(&self) -> Result<Vec<LogRecord>> {
        if !self.log_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.log_dir).map_err(|e| KeystoneError::io(&self.log_dir, e))?;
        let mut segments: Vec<(Lsn, Lsn, PathBuf, String)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KeystoneError::io(&self.log_dir, e))?;
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            match wal::parse_segment_file_name(&name) {
                Some((start_lsn, end_lsn)) => segments.push((start_lsn, end_lsn, path, name)),
                None => {
                    debug!("ignoring non-segment file '{}'", name);
                }
            }
        }
        segments.sort_by_key(|s| s.0);

        let mut records = Vec::new();
        for (start_lsn, end_lsn, path, name) in segments {
            if start_lsn != records.len() as Lsn {
                return Err(KeystoneError::corrupt(
                    name,
                    format!(
                        "segment starts at LSN {} but the log ends at LSN {}",
                        start_lsn,
                        records.len()
                    ),
                ));
            }
            if end_lsn < start_lsn {
                return Err(KeystoneError::corrupt(
                    name,
                    format!("end LSN {} precedes start LSN {}", end_lsn, start_lsn),
                ));
            }
            let mut segment = wal::read_segment(&path)?;
            records.append(&mut segment);
            if records.len() as Lsn != end_lsn + 1 {
                return Err(KeystoneError::corrupt(
                    name,
                    format!(
                        "segment claims end LSN {} but the log now holds {} records",
                        end_lsn,
                        records.len()
                    ),
                ));
            }
        }

        info!(
            "recovered {} log records from {}",
            records.len(),
            self.log_dir.display()
        );
        Ok(records)
    }
}
