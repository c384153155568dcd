//! Error types for keystone-kv
//!
//! Defines a unified error type covering transaction validation failures,
//! missing keys, and log persistence problems.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use crate::types::Tid;

/// Unified error type for store operations
#[derive(Debug)]
pub enum KeystoneError {
    /// I/O error while enumerating, reading, or writing log segments
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// Operation issued against an unknown or terminated transaction
    TransactionNotRunning(Tid),
    /// get/delete/abort-restore against a key that is not in the store
    KeyNotFound(String),
    /// set called without a value
    InvalidValue,
    /// A segment file's name or contents violate the log invariants
    CorruptLog {
        name: String,
        reason: String,
    },
}

impl KeystoneError {
    /// Create an I/O error tagged with the path being operated on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        KeystoneError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a corrupt-log error for the named segment file
    pub fn corrupt(name: impl Into<String>, reason: impl Into<String>) -> Self {
        KeystoneError::CorruptLog {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeystoneError::Io { path, source } => {
                write!(f, "I/O error on '{}': {}", path.display(), source)
            }
            KeystoneError::TransactionNotRunning(tid) => {
                write!(f, "Transaction {} is not running", tid)
            }
            KeystoneError::KeyNotFound(key) => write!(f, "Key '{}' not found", key),
            KeystoneError::InvalidValue => write!(f, "Value must be present"),
            KeystoneError::CorruptLog { name, reason } => {
                write!(f, "Corrupt log segment '{}': {}", name, reason)
            }
        }
    }
}

impl std::error::Error for KeystoneError {}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, KeystoneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = KeystoneError::io("/tmp/nope", io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(err.to_string().contains("/tmp/nope"));

        let err = KeystoneError::TransactionNotRunning(7);
        assert_eq!(err.to_string(), "Transaction 7 is not running");

        let err = KeystoneError::KeyNotFound("a".to_string());
        assert_eq!(err.to_string(), "Key 'a' not found");

        let err = KeystoneError::corrupt("000000000000_000000000003.log", "truncated");
        assert!(err.to_string().contains("000000000000_000000000003.log"));
        assert!(err.to_string().contains("truncated"));
    }
}
