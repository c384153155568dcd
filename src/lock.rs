//! Per-key value cells and the lock handles transactions hold on them
//!
//! Each key maps to a [`ValueCell`] carrying the current value and a
//! reader/writer lock. The lock is held across calls for the lifetime of a
//! transaction, so it is acquired and released explicitly rather than through
//! guard lifetimes. A [`LockHandle`] gives one transaction an idempotent,
//! mode-aware view of a cell's lock: repeated acquisitions are no-ops, a read
//! lock can be promoted to write, and a single `release` works in either mode.
//!
//! Cells are shared via `Arc`: when a delete removes a key from the store map,
//! the cell stays alive through the handles that still reference it, and its
//! write lock is released on transaction termination like any other.

use std::sync::{Arc, Condvar, Mutex};

use crate::types::Value;

#[derive(Default)]
struct CellLockState {
    readers: usize,
    writer: bool,
}

/// A reader/writer lock with explicit acquire/release operations.
///
/// Unlike `std::sync::RwLock`, nothing ties the lock to a guard's lifetime:
/// a holder locks in one call and unlocks in a later one. Waiting is done on a
/// condvar; there is no fairness policy and no deadlock detection.
struct CellLock {
    state: Mutex<CellLockState>,
    cond: Condvar,
}

impl CellLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(CellLockState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock_shared(&self) {
        let mut state = self.state.lock().expect("cell lock poisoned");
        while state.writer {
            state = self.cond.wait(state).expect("cell lock poisoned");
        }
        state.readers += 1;
    }

    fn lock_exclusive(&self) {
        let mut state = self.state.lock().expect("cell lock poisoned");
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).expect("cell lock poisoned");
        }
        state.writer = true;
    }

    fn unlock_shared(&self) {
        let mut state = self.state.lock().expect("cell lock poisoned");
        state.readers -= 1;
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn unlock_exclusive(&self) {
        let mut state = self.state.lock().expect("cell lock poisoned");
        state.writer = false;
        self.cond.notify_all();
    }
}

/// Per-key container holding the current value and the lock that guards it
pub struct ValueCell {
    /// Serializes raw access only; transactional exclusion comes from `lock`
    value: Mutex<Option<Value>>,
    lock: CellLock,
}

impl ValueCell {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            lock: CellLock::new(),
        }
    }

    /// Copy out the current value, if any
    pub fn read(&self) -> Option<Value> {
        self.value.lock().expect("cell value poisoned").clone()
    }

    /// Install a new value, returning the previous one
    pub fn install(&self, value: Option<Value>) -> Option<Value> {
        let mut guard = self.value.lock().expect("cell value poisoned");
        std::mem::replace(&mut *guard, value)
    }
}

impl Default for ValueCell {
    fn default() -> Self {
        Self::new()
    }
}

struct HandleState {
    held: bool,
    writer: bool,
}

/// One transaction's view of a cell's lock
///
/// A handle belongs to a single transaction and is driven from that
/// transaction's thread of control; the internal mutex only protects the
/// bookkeeping against observers.
pub struct LockHandle {
    cell: Arc<ValueCell>,
    state: Mutex<HandleState>,
}

impl LockHandle {
    /// Create a handle bound to the given cell, holding nothing yet
    pub fn new(cell: Arc<ValueCell>) -> Self {
        Self {
            cell,
            state: Mutex::new(HandleState {
                held: false,
                writer: false,
            }),
        }
    }

    /// The cell this handle locks
    pub fn cell(&self) -> &Arc<ValueCell> {
        &self.cell
    }

    fn mode(&self) -> (bool, bool) {
        let state = self.state.lock().expect("lock handle poisoned");
        (state.held, state.writer)
    }

    fn set_mode(&self, held: bool, writer: bool) {
        let mut state = self.state.lock().expect("lock handle poisoned");
        state.held = held;
        state.writer = writer;
    }

    /// Acquire the cell's lock in read mode. No-op if the handle already
    /// holds the lock in either mode. Blocks while a writer holds the cell.
    pub fn read_lock(&self) {
        let (held, _) = self.mode();
        if held {
            return;
        }
        self.cell.lock.lock_shared();
        self.set_mode(true, false);
    }

    /// Acquire the cell's lock in write mode, promoting a held read lock.
    /// No-op if already write-held.
    ///
    /// Promotion releases the read lock before taking the write lock, so
    /// another writer may slip in between; a value observed through a read
    /// is not guaranteed to survive into the write.
    pub fn write_lock(&self) {
        let (held, writer) = self.mode();
        if held && writer {
            return;
        }
        if held {
            self.cell.lock.unlock_shared();
        }
        self.cell.lock.lock_exclusive();
        self.set_mode(true, true);
    }

    /// Promote a held read lock to write mode. No-op if already write-held.
    /// Subject to the same unlocked window as [`write_lock`](Self::write_lock).
    pub fn promote(&self) {
        self.write_lock();
    }

    /// Release the lock in whatever mode it is held. No-op when not held.
    pub fn release(&self) {
        let mut state = self.state.lock().expect("lock handle poisoned");
        if !state.held {
            return;
        }
        if state.writer {
            self.cell.lock.unlock_exclusive();
        } else {
            self.cell.lock.unlock_shared();
        }
        state.held = false;
        state.writer = false;
    }

    pub fn is_read_held(&self) -> bool {
        let (held, writer) = self.mode();
        held && !writer
    }

    pub fn is_write_held(&self) -> bool {
        let (held, writer) = self.mode();
        held && writer
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_read_lock_idempotent() {
        let cell = Arc::new(ValueCell::new());
        let handle = LockHandle::new(cell);

        handle.read_lock();
        handle.read_lock();
        assert!(handle.is_read_held());
        assert!(!handle.is_write_held());

        handle.release();
        assert!(!handle.is_read_held());
    }

    #[test]
    fn test_write_lock_idempotent() {
        let cell = Arc::new(ValueCell::new());
        let handle = LockHandle::new(cell);

        handle.write_lock();
        handle.write_lock();
        assert!(handle.is_write_held());

        handle.release();
        assert!(!handle.is_write_held());
    }

    #[test]
    fn test_promotion() {
        let cell = Arc::new(ValueCell::new());
        let handle = LockHandle::new(cell);

        handle.read_lock();
        assert!(handle.is_read_held());

        handle.promote();
        assert!(handle.is_write_held());
        assert!(!handle.is_read_held());

        // write_lock after read_lock takes the same path
        handle.release();
        handle.read_lock();
        handle.write_lock();
        assert!(handle.is_write_held());
        handle.release();
    }

    #[test]
    fn test_release_idempotent() {
        let cell = Arc::new(ValueCell::new());
        let handle = LockHandle::new(cell);

        handle.release();
        handle.read_lock();
        handle.release();
        handle.release();
        assert!(!handle.is_read_held());

        // cell must be free again
        let other = LockHandle::new(Arc::clone(handle.cell()));
        other.write_lock();
        assert!(other.is_write_held());
    }

    #[test]
    fn test_two_readers_share() {
        let cell = Arc::new(ValueCell::new());
        let h1 = LockHandle::new(Arc::clone(&cell));
        let h2 = LockHandle::new(Arc::clone(&cell));

        h1.read_lock();
        h2.read_lock();
        assert!(h1.is_read_held());
        assert!(h2.is_read_held());
    }

    #[test]
    fn test_writer_blocks_reader() {
        let cell = Arc::new(ValueCell::new());
        let writer = LockHandle::new(Arc::clone(&cell));
        writer.write_lock();

        let (tx, rx) = mpsc::channel();
        let reader_cell = Arc::clone(&cell);
        let t = thread::spawn(move || {
            let reader = LockHandle::new(reader_cell);
            reader.read_lock();
            tx.send(()).unwrap();
            reader.release();
        });

        // reader must not get through while the writer holds the cell
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        writer.release();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("reader never acquired after writer released");
        t.join().unwrap();
    }

    #[test]
    fn test_drop_releases() {
        let cell = Arc::new(ValueCell::new());
        {
            let handle = LockHandle::new(Arc::clone(&cell));
            handle.write_lock();
        }
        let handle = LockHandle::new(cell);
        handle.write_lock();
        assert!(handle.is_write_held());
    }

    #[test]
    fn test_cell_install_returns_previous() {
        let cell = ValueCell::new();
        assert_eq!(cell.read(), None);
        assert_eq!(cell.install(Some(vec![1])), None);
        assert_eq!(cell.install(Some(vec![2])), Some(vec![1]));
        assert_eq!(cell.read(), Some(vec![2]));
    }
}
