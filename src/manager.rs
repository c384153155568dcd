//! Transactional log manager
//!
//! The log manager couples the in-memory store map with a write-ahead log and
//! hands out transactions over it.
//!
//! ## Transaction protocol
//!
//! 1. BEGIN: allocate a transaction ID, append a BEGIN record
//! 2. GET/SET/DELETE: lock the touched key through the transaction's handle,
//!    apply the change to the cell, append an UPDATE record carrying the old
//!    and new value
//! 3. COMMIT: append COMMIT and END, flush everything unflushed as one new
//!    log segment, release the transaction's locks
//! 4. ABORT: append ABORT, walk the log backwards reinstalling pre-images and
//!    appending a compensating UNDO record per reversed UPDATE, append END,
//!    flush best-effort, release the transaction's locks
//!
//! A transaction is live until its COMMIT or ABORT record is appended; from
//! then on it admits no further reads or writes. A commit stuck on a failed
//! flush may only be retried or escalated to an abort, and either terminal
//! path ends with the locks released and the transaction retired.
//!
//! ## Isolation: strict two-phase locking
//!
//! Every key a transaction reads is held in read mode and every key it writes
//! in write mode until the transaction terminates. Locks are granted per key
//! in the order transactions ask for them; there is no deadlock detection, so
//! callers are responsible for acquisition order.
//!
//! ## Logging and durability
//!
//! LSNs are dense and assigned under a single log mutex, so the record at
//! index `i` always has LSN `i` and flushed segments chain contiguously.
//! A successful commit returns only after its records, END included, are in
//! a flushed segment. Recovery at construction reloads the segments and
//! resumes LSN and TID assignment past everything already on disk.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info, warn};

use crate::error::{KeystoneError, Result};
use crate::lock::{LockHandle, ValueCell};
use crate::log::{LogOperation, LogRecord};
use crate::recovery::RecoveryManager;
use crate::store::StoreMap;
use crate::types::{Key, Lsn, Tid, Transaction, TxnState, Value};
use crate::wal;

/// Log directory used when the configured path is empty
pub const DEFAULT_LOG_DIR: &str = "./data";

fn resolve_log_dir(log_dir: PathBuf) -> PathBuf {
    if log_dir.as_os_str().is_empty() {
        PathBuf::from(DEFAULT_LOG_DIR)
    } else {
        log_dir
    }
}

/// In-memory log plus the flush watermark, guarded by one mutex
struct LogState {
    records: Vec<LogRecord>,
    next_lsn_to_flush: Lsn,
}

/// An UPDATE collected for reversal during abort, tail-first
struct PendingUndo {
    lsn: Lsn,
    key: Key,
    old_value: Option<Value>,
    new_value: Option<Value>,
}

/// The log manager
///
/// Owns the store map, the log, the LSN/TID counters, and the table of live
/// transactions with the lock handles they hold.
pub struct LogManager {
    /// Directory for log segment files
    log_dir: PathBuf,
    /// The append-only record sequence; `records.len()` is the next LSN
    log: Mutex<LogState>,
    /// Next transaction ID
    next_tid: AtomicU64,
    /// Key to value-cell mapping
    store: StoreMap,
    /// Live transactions (tid -> transaction context)
    txns: RwLock<HashMap<Tid, Transaction>>,
}

impl LogManager {
    /// Open a log manager over `log_dir`, creating the directory if needed
    /// and recovering any log segments already present. An empty path selects
    /// [`DEFAULT_LOG_DIR`].
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        let log_dir = resolve_log_dir(log_dir);
        fs::create_dir_all(&log_dir).map_err(|e| KeystoneError::io(&log_dir, e))?;

        let records = RecoveryManager::new(log_dir.clone()).recover()?;
        let next_tid = records.iter().map(|r| r.tid + 1).max().unwrap_or(0);
        let next_lsn_to_flush = records.len() as Lsn;
        info!(
            "log manager ready: next LSN {}, next TID {}",
            records.len(),
            next_tid
        );

        Ok(Self {
            log_dir,
            log: Mutex::new(LogState {
                records,
                next_lsn_to_flush,
            }),
            next_tid: AtomicU64::new(next_tid),
            store: StoreMap::new(),
            txns: RwLock::new(HashMap::new()),
        })
    }

    /// The directory segments are flushed to
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// LSN the next appended record will receive
    pub fn next_lsn(&self) -> Lsn {
        let log = self.log.lock().expect("log mutex poisoned");
        log.records.len() as Lsn
    }

    /// First LSN not yet covered by a flushed segment
    pub fn next_lsn_to_flush(&self) -> Lsn {
        let log = self.log.lock().expect("log mutex poisoned");
        log.next_lsn_to_flush
    }

    /// Whether the transaction is live and accepting operations. A
    /// transaction whose terminal record has been appended is no longer
    /// active even while it still holds its locks.
    pub fn is_active(&self, tid: Tid) -> bool {
        matches!(self.txn_state(tid), Some(TxnState::Active))
    }

    /// Begin a new transaction
    pub fn begin(&self) -> Tid {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        let begin_lsn = self.append(tid, LogOperation::Begin);

        let txn = Transaction::new(tid, begin_lsn);
        self.txns
            .write()
            .expect("transaction table poisoned")
            .insert(tid, txn);

        debug!("transaction {} began at LSN {}", tid, begin_lsn);
        tid
    }

    /// Read the current value of `key` under a read lock held until the
    /// transaction terminates
    pub fn get(&self, tid: Tid, key: &str) -> Result<Value> {
        self.check_active(tid)?;
        let cell = self.store.get_cell(key, false)?;
        let handle = self.handle_for(tid, key, &cell)?;
        handle.read_lock();
        cell.read()
            .ok_or_else(|| KeystoneError::KeyNotFound(key.to_string()))
    }

    /// Install `value` under `key`, creating the key if needed. The write
    /// lock is held until the transaction terminates. An absent value is
    /// rejected with `InvalidValue` before any state changes.
    pub fn set(&self, tid: Tid, key: &str, value: Option<Value>) -> Result<()> {
        self.check_active(tid)?;
        let value = value.ok_or(KeystoneError::InvalidValue)?;
        let handle = match self.existing_handle(tid, key) {
            // if this transaction deleted the key earlier, the map entry is
            // gone but the handle still owns the locked cell; re-anchor that
            // cell so the map never serves an unlocked stand-in
            Some(handle) => {
                self.store.restore_cell(key, Arc::clone(handle.cell()));
                handle
            }
            None => {
                let cell = self.store.get_cell(key, true)?;
                self.handle_for(tid, key, &cell)?
            }
        };
        handle.write_lock();

        let old_value = handle.cell().install(Some(value.clone()));
        self.append(
            tid,
            LogOperation::Update {
                key: key.to_string(),
                old_value,
                new_value: Some(value),
            },
        );
        Ok(())
    }

    /// Remove `key` from the store. The cell survives empty, write-locked
    /// through this transaction's handle, until the transaction terminates.
    pub fn delete(&self, tid: Tid, key: &str) -> Result<()> {
        self.check_active(tid)?;
        let cell = self.store.get_cell(key, false)?;
        let handle = self.handle_for(tid, key, &cell)?;
        handle.write_lock();

        // clear the cell as well: a later set through the same handle must
        // see an absent pre-image
        let old_value = cell.install(None);
        self.store.drop_key(key);
        self.append(
            tid,
            LogOperation::Update {
                key: key.to_string(),
                old_value,
                new_value: None,
            },
        );
        Ok(())
    }

    /// Commit the transaction: log the decision, flush, release locks.
    ///
    /// Appending the COMMIT record moves the transaction out of the live
    /// state, so no further reads or writes are admitted even if the flush
    /// fails. A flush failure is returned to the caller with the locks still
    /// held; the only legal follow-ups are retrying the commit (which
    /// flushes again without appending new records) or escalating to abort.
    pub fn commit(&self, tid: Tid) -> Result<()> {
        match self.txn_state(tid) {
            Some(TxnState::Active) => {
                self.append(tid, LogOperation::Commit);
                self.append(tid, LogOperation::End);
                self.set_state(tid, TxnState::Committing);
            }
            // retry after a failed flush: the records are already in the log
            Some(TxnState::Committing) => {}
            _ => return Err(KeystoneError::TransactionNotRunning(tid)),
        }
        self.flush()?;
        self.finish(tid, TxnState::Committed);
        debug!("transaction {} committed", tid);
        Ok(())
    }

    /// Abort the transaction: undo its updates through the log tail, log the
    /// compensations, flush best-effort, release locks.
    ///
    /// Also accepted as the escalation path for a commit whose flush failed;
    /// the decision records of the failed commit stay in the log ahead of the
    /// ABORT record.
    pub fn abort(&self, tid: Tid) -> Result<()> {
        match self.txn_state(tid) {
            Some(TxnState::Active) | Some(TxnState::Committing) => {}
            _ => return Err(KeystoneError::TransactionNotRunning(tid)),
        }
        self.append(tid, LogOperation::Abort);
        self.set_state(tid, TxnState::Aborting);

        for pending in self.collect_undo(tid) {
            let handle = self
                .existing_handle(tid, &pending.key)
                .ok_or_else(|| KeystoneError::KeyNotFound(pending.key.clone()))?;
            handle.write_lock();

            if pending.old_value.is_some() {
                let cell = match self.store.get_cell(&pending.key, false) {
                    Ok(cell) => cell,
                    Err(_) => {
                        // a delete removed this key from the map; put its cell back
                        let cell = Arc::clone(handle.cell());
                        self.store.restore_cell(&pending.key, Arc::clone(&cell));
                        cell
                    }
                };
                cell.install(pending.old_value.clone());
            } else {
                // the reversed update created this key; undoing it removes it
                if let Ok(cell) = self.store.get_cell(&pending.key, false) {
                    cell.install(None);
                }
                self.store.drop_key(&pending.key);
            }

            self.append(
                tid,
                LogOperation::Undo {
                    key: pending.key,
                    old_value: pending.new_value,
                    new_value: pending.old_value,
                    undo_lsn: pending.lsn,
                },
            );
        }

        self.append(tid, LogOperation::End);
        if let Err(e) = self.flush() {
            warn!("flush after aborting transaction {} failed: {}", tid, e);
        }
        self.finish(tid, TxnState::Aborted);
        debug!("transaction {} aborted", tid);
        Ok(())
    }

    /// Append a record under the log mutex, assigning the next LSN
    fn append(&self, tid: Tid, op: LogOperation) -> Lsn {
        let mut log = self.log.lock().expect("log mutex poisoned");
        let lsn = log.records.len() as Lsn;
        log.records.push(LogRecord { lsn, tid, op });
        lsn
    }

    /// Write all unflushed records as one new segment. The flush watermark
    /// only advances on success, so a failed segment can be retried. Nothing
    /// unflushed means nothing to write and no file.
    fn flush(&self) -> Result<()> {
        let mut log = self.log.lock().expect("log mutex poisoned");
        let start_lsn = log.next_lsn_to_flush;
        let next_lsn = log.records.len() as Lsn;
        if start_lsn == next_lsn {
            return Ok(());
        }
        let end_lsn = next_lsn - 1;
        wal::write_segment(
            &self.log_dir,
            start_lsn,
            end_lsn,
            &log.records[start_lsn as usize..],
        )?;
        log.next_lsn_to_flush = next_lsn;
        debug!("flushed segment [{}, {}]", start_lsn, end_lsn);
        Ok(())
    }

    fn check_active(&self, tid: Tid) -> Result<()> {
        if self.is_active(tid) {
            Ok(())
        } else {
            Err(KeystoneError::TransactionNotRunning(tid))
        }
    }

    fn txn_state(&self, tid: Tid) -> Option<TxnState> {
        let txns = self.txns.read().expect("transaction table poisoned");
        txns.get(&tid).map(|txn| txn.state)
    }

    fn set_state(&self, tid: Tid, state: TxnState) {
        let mut txns = self.txns.write().expect("transaction table poisoned");
        if let Some(txn) = txns.get_mut(&tid) {
            txn.state = state;
        }
    }

    /// Get or create the transaction's handle for `key`. A new handle is
    /// bound to `cell`; an existing one keeps its original binding.
    fn handle_for(
        &self,
        tid: Tid,
        key: &str,
        cell: &Arc<ValueCell>,
    ) -> Result<Arc<LockHandle>> {
        let mut txns = self.txns.write().expect("transaction table poisoned");
        let txn = txns
            .get_mut(&tid)
            .ok_or(KeystoneError::TransactionNotRunning(tid))?;
        let handle = txn
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockHandle::new(Arc::clone(cell))));
        Ok(Arc::clone(handle))
    }

    fn existing_handle(&self, tid: Tid, key: &str) -> Option<Arc<LockHandle>> {
        let txns = self.txns.read().expect("transaction table poisoned");
        txns.get(&tid)?.locks.get(key).cloned()
    }

    /// Collect the transaction's UPDATE records from the log tail back to its
    /// BEGIN, in reversal order
    fn collect_undo(&self, tid: Tid) -> Vec<PendingUndo> {
        let log = self.log.lock().expect("log mutex poisoned");
        let mut pending = Vec::new();
        for record in log.records.iter().rev() {
            if record.tid != tid {
                continue;
            }
            match &record.op {
                LogOperation::Update {
                    key,
                    old_value,
                    new_value,
                } => pending.push(PendingUndo {
                    lsn: record.lsn,
                    key: key.clone(),
                    old_value: old_value.clone(),
                    new_value: new_value.clone(),
                }),
                LogOperation::Begin => break,
                _ => {}
            }
        }
        pending
    }

    /// Release every lock the transaction holds and retire it
    fn finish(&self, tid: Tid, state: TxnState) {
        let mut txns = self.txns.write().expect("transaction table poisoned");
        if let Some(txn) = txns.get_mut(&tid) {
            txn.state = state;
            for handle in txn.locks.values() {
                handle.release();
            }
        }
        txns.remove(&tid);
    }
}
