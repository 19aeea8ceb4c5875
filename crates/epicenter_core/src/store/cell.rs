//! Cell-granular storage over the last-write-wins KV.
//!
//! A [`CellStore`] namespaces LWW keys as `rowId:columnId`, so every cell is
//! an independent LWW register: concurrent edits to different columns of the
//! same row merge without clobbering each other, and a cell delete removes
//! the underlying entry entirely.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use yrs::Doc;

use crate::kv::{EntryChange, ObserverHandle, YKeyValueLww};
use crate::kv::batch::TxnQueue;

/// Separator between the row and column part of a cell key. Neither id may
/// contain it.
pub const CELL_SEPARATOR: char = ':';

/// What happened to a cell in one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAction {
    /// The cell did not exist before.
    Add,
    /// The cell existed and its value changed.
    Update,
    /// The cell was removed.
    Delete,
}

/// A single cell change, delivered to [`CellStore::observe`] handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    /// Row part of the cell coordinate
    pub row_id: String,
    /// Column part of the cell coordinate
    pub column_id: String,
    /// What happened
    pub action: CellAction,
    /// Value after the change (`None` for deletes)
    pub value: Option<Value>,
    /// Value before the change (`None` for adds)
    pub previous: Option<Value>,
}

/// Compose a cell key; panics if either id contains the separator
/// (programmer error — ids are chosen by the caller, not by users).
pub(crate) fn cell_key(row_id: &str, column_id: &str) -> String {
    assert!(
        !row_id.contains(CELL_SEPARATOR),
        "row id '{}' must not contain '{}'",
        row_id,
        CELL_SEPARATOR
    );
    assert!(
        !column_id.contains(CELL_SEPARATOR),
        "column id '{}' must not contain '{}'",
        column_id,
        CELL_SEPARATOR
    );
    format!("{}{}{}", row_id, CELL_SEPARATOR, column_id)
}

/// Split a cell key back into `(rowId, columnId)`.
pub(crate) fn split_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(CELL_SEPARATOR)
}

/// Namespaced per-(row, column) cell storage with batch transactions and
/// change events.
#[derive(Clone)]
pub struct CellStore {
    kv: YKeyValueLww<Value>,
}

impl CellStore {
    /// Create a cell store over the named array of `doc`.
    pub fn new(doc: &Doc, name: &str) -> Self {
        Self {
            kv: YKeyValueLww::new(doc, name),
        }
    }

    /// Create a cell store sharing a transaction queue with other stores on
    /// the same document (workspace batching).
    pub(crate) fn with_queue(doc: &Doc, name: &str, queue: Arc<TxnQueue>) -> Self {
        Self {
            kv: YKeyValueLww::with_queue(
                doc,
                name,
                queue,
                Arc::new(|| chrono::Utc::now().timestamp_millis()),
            ),
        }
    }

    /// Get the value of one cell.
    pub fn get_cell(&self, row_id: &str, column_id: &str) -> Option<Value> {
        self.kv.get(&cell_key(row_id, column_id))
    }

    /// Set the value of one cell.
    pub fn set_cell(&self, row_id: &str, column_id: &str, value: Value) {
        self.kv.set(cell_key(row_id, column_id), value);
    }

    /// Remove one cell entirely (no tombstone at this layer).
    pub fn delete_cell(&self, row_id: &str, column_id: &str) {
        self.kv.delete(&cell_key(row_id, column_id));
    }

    /// Whether the cell currently holds a value.
    pub fn has_cell(&self, row_id: &str, column_id: &str) -> bool {
        self.kv.has(&cell_key(row_id, column_id))
    }

    /// Run `f` with all cell writes coalesced into one transaction, so
    /// observers fire once.
    pub fn batch<R>(&self, f: impl FnOnce(&CellBatch<'_>) -> R) -> R {
        self.kv.transact(|| f(&CellBatch { store: self }))
    }

    /// Register a change handler. Fires once per committed transaction with
    /// every affected cell, sorted by (row, column) for determinism.
    pub fn observe(&self, f: impl Fn(&[CellChange]) + Send + Sync + 'static) -> ObserverHandle {
        self.kv.observe(move |changes: &HashMap<String, EntryChange<Value>>| {
            let mut cells: Vec<CellChange> = changes
                .iter()
                .filter_map(|(key, change)| {
                    let (row_id, column_id) = split_key(key)?;
                    let (action, value, previous) = match change {
                        EntryChange::Added { new } => (CellAction::Add, Some(new.clone()), None),
                        EntryChange::Updated { old, new } => {
                            (CellAction::Update, Some(new.clone()), Some(old.clone()))
                        }
                        EntryChange::Removed { old } => {
                            (CellAction::Delete, None, Some(old.clone()))
                        }
                    };
                    Some(CellChange {
                        row_id: row_id.to_string(),
                        column_id: column_id.to_string(),
                        action,
                        value,
                        previous,
                    })
                })
                .collect();
            cells.sort_by(|a, b| {
                (a.row_id.as_str(), a.column_id.as_str())
                    .cmp(&(b.row_id.as_str(), b.column_id.as_str()))
            });
            if !cells.is_empty() {
                f(&cells);
            }
        })
    }

    /// Remove a previously registered change handler.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.kv.unobserve(handle);
    }

    /// The underlying LWW store (row reconstruction, prefix scans).
    pub(crate) fn kv(&self) -> &YKeyValueLww<Value> {
        &self.kv
    }
}

impl std::fmt::Debug for CellStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellStore")
            .field("cells", &self.kv.len())
            .finish()
    }
}

/// Write proxy handed to [`CellStore::batch`] callbacks.
pub struct CellBatch<'a> {
    store: &'a CellStore,
}

impl CellBatch<'_> {
    /// Set a cell inside the open batch.
    pub fn set_cell(&self, row_id: &str, column_id: &str, value: Value) {
        self.store.set_cell(row_id, column_id, value);
    }

    /// Delete a cell inside the open batch.
    pub fn delete_cell(&self, row_id: &str, column_id: &str) {
        self.store.delete_cell(row_id, column_id);
    }
}
