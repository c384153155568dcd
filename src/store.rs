//! Key to value-cell mapping with create-on-demand

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{KeystoneError, Result};
use crate::lock::ValueCell;
use crate::types::Key;

/// The in-memory map from keys to their cells
///
/// Structural changes happen under the log manager's transactional entry
/// points; the inner lock only serializes the map itself. Cells are handed
/// out as `Arc`s, so a cell removed by `drop_key` stays alive for the
/// transactions still holding its lock.
pub struct StoreMap {
    cells: RwLock<HashMap<Key, Arc<ValueCell>>>,
}

impl StoreMap {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the cell for `key`, creating one when `create_if_missing` is
    /// set. Fails with `KeyNotFound` when the key is absent and creation was
    /// not requested.
    pub fn get_cell(&self, key: &str, create_if_missing: bool) -> Result<Arc<ValueCell>> {
        if !create_if_missing {
            let cells = self.cells.read().expect("store map poisoned");
            return cells
                .get(key)
                .cloned()
                .ok_or_else(|| KeystoneError::KeyNotFound(key.to_string()));
        }
        let mut cells = self.cells.write().expect("store map poisoned");
        Ok(Arc::clone(
            cells
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ValueCell::new())),
        ))
    }

    /// Remove the key's entry. The caller holds the cell's write lock through
    /// its handle and releases it on transaction termination.
    pub fn drop_key(&self, key: &str) {
        let mut cells = self.cells.write().expect("store map poisoned");
        cells.remove(key);
    }

    /// Put a cell back under `key` unless another one took its place.
    /// Used by abort to re-materialise a key that a delete removed.
    pub fn restore_cell(&self, key: &str, cell: Arc<ValueCell>) {
        let mut cells = self.cells.write().expect("store map poisoned");
        cells.entry(key.to_string()).or_insert(cell);
    }

    /// Whether the key currently has a cell
    pub fn contains_key(&self, key: &str) -> bool {
        let cells = self.cells.read().expect("store map poisoned");
        cells.contains_key(key)
    }
}

impl Default for StoreMap {
    fn default() -> Self {
        Self::new()
    }
}
