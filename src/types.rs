//! Core transaction types and state management

use std::collections::HashMap;
use std::sync::Arc;

use crate::lock::LockHandle;

/// Log Sequence Number - dense position of a record in the log
pub type Lsn = u64;

/// Transaction ID
pub type Tid = u64;

/// Keys are text strings compared by value
pub type Key = String;

/// Values are opaque byte strings
pub type Value = Vec<u8>;

/// Transaction state
///
/// A transaction is live only while `Active`. Appending its COMMIT or ABORT
/// record moves it to the matching terminating state, which admits no new
/// reads or writes: a `Committing` transaction whose flush failed may only
/// retry the commit or escalate to abort, and an `Aborting` one is mid-undo.
/// The terminal states are set just before the transaction leaves the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    /// COMMIT and END are in the log; awaiting a successful flush
    Committing,
    /// ABORT is in the log; undo in progress
    Aborting,
    Committed,
    Aborted,
}

/// In-memory transaction context
pub struct Transaction {
    /// Transaction ID
    pub id: Tid,
    /// Current state
    pub state: TxnState,
    /// LSN of the BEGIN record
    pub begin_lsn: Lsn,
    /// Lock handles held by this transaction, one per touched key
    pub locks: HashMap<Key, Arc<LockHandle>>,
}

impl Transaction {
    pub fn new(id: Tid, begin_lsn: Lsn) -> Self {
        Self {
            id,
            state: TxnState::Active,
            begin_lsn,
            locks: HashMap::new(),
        }
    }
}
