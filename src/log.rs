//! Log record structures

use serde::{Deserialize, Serialize};

use crate::types::{Key, Lsn, Tid, Value};

/// One record in the write-ahead log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number, equal to the record's position in the log
    pub lsn: Lsn,
    /// Transaction ID
    pub tid: Tid,
    /// The operation
    pub op: LogOperation,
}

/// Operations that can be logged
///
/// An absent `old_value` means the key did not exist before the change; an
/// absent `new_value` means the change removed the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOperation {
    /// Transaction started
    Begin,
    /// A key's cell changed from old to new
    Update {
        key: Key,
        old_value: Option<Value>,
        new_value: Option<Value>,
    },
    /// Transaction decided to commit
    Commit,
    /// Transaction decided to abort
    Abort,
    /// Transaction fully terminated
    End,
    /// Compensating record: the pre-image of the UPDATE at `undo_lsn` was
    /// reinstalled, so old/new here are the reverse of that UPDATE's
    Undo {
        key: Key,
        old_value: Option<Value>,
        new_value: Option<Value>,
        undo_lsn: Lsn,
    },
}
