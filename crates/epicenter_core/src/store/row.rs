//! Row semantics over cell-granular storage.
//!
//! A [`RowStore`] stores nothing itself: a row is the set of cells sharing a
//! `(rowId, columnId)` prefix, reconstructed by prefix scan. Row identity is
//! derived from cells; deleting a row means deleting every cell under it.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::cell::{CELL_SEPARATOR, CellChange, CellStore};
use crate::kv::ObserverHandle;

/// Whether `key` belongs to `row_id`, rejecting prefix collisions:
/// `"ab:x"` must not match row `"a"`.
fn key_in_row(key: &str, row_id: &str) -> bool {
    key.len() > row_id.len()
        && key.as_bytes()[row_id.len()] == CELL_SEPARATOR as u8
        && key.starts_with(row_id)
}

/// Row reconstruction, existence, and bulk delete over a [`CellStore`].
#[derive(Clone)]
pub struct RowStore {
    cells: CellStore,
}

impl RowStore {
    /// Create a row view over `cells`.
    pub fn new(cells: CellStore) -> Self {
        Self { cells }
    }

    /// Reconstruct a row as a `columnId -> value` object, or `None` if no
    /// cell with the row's prefix exists.
    pub fn get(&self, row_id: &str) -> Option<Map<String, Value>> {
        let mut row = Map::new();
        for (key, entry) in self.cells.kv().entries() {
            if key_in_row(&key, row_id) {
                let column = key[row_id.len() + 1..].to_string();
                row.insert(column, entry.val);
            }
        }
        if row.is_empty() { None } else { Some(row) }
    }

    /// Whether any cell exists under the row's prefix. Early-exits on the
    /// first hit.
    pub fn has(&self, row_id: &str) -> bool {
        self.cells
            .kv()
            .keys()
            .iter()
            .any(|key| key_in_row(key, row_id))
    }

    /// All row ids, deduplicated and sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for key in self.cells.kv().keys() {
            if let Some((row, _)) = key.split_once(CELL_SEPARATOR) {
                ids.insert(row.to_string());
            }
        }
        ids.into_iter().collect()
    }

    /// Number of distinct rows.
    pub fn count(&self) -> usize {
        self.ids().len()
    }

    /// Assemble every row, sorted by row id.
    pub fn get_all(&self) -> Vec<(String, Map<String, Value>)> {
        let mut rows: Vec<(String, Map<String, Value>)> = Vec::new();
        for (key, entry) in self.cells.kv().entries() {
            let Some((row_id, column)) = key.split_once(CELL_SEPARATOR) else {
                continue;
            };
            match rows.last_mut() {
                Some((last_id, map)) if last_id == row_id => {
                    map.insert(column.to_string(), entry.val);
                }
                _ => {
                    let mut map = Map::new();
                    map.insert(column.to_string(), entry.val);
                    rows.push((row_id.to_string(), map));
                }
            }
        }
        rows
    }

    /// Delete every cell of the row in one transaction. A no-op for unknown
    /// rows.
    pub fn delete(&self, row_id: &str) {
        let columns: Vec<String> = self
            .cells
            .kv()
            .keys()
            .into_iter()
            .filter(|key| key_in_row(key, row_id))
            .map(|key| key[row_id.len() + 1..].to_string())
            .collect();
        if columns.is_empty() {
            return;
        }
        self.cells.batch(|tx| {
            for column in &columns {
                tx.delete_cell(row_id, column);
            }
        });
    }

    /// Register a row-level change handler: fires once per committed
    /// transaction with the set of affected row ids.
    pub fn observe(&self, f: impl Fn(&BTreeSet<String>) + Send + Sync + 'static) -> ObserverHandle {
        self.cells.observe(move |changes: &[CellChange]| {
            let row_ids: BTreeSet<String> =
                changes.iter().map(|c| c.row_id.clone()).collect();
            if !row_ids.is_empty() {
                f(&row_ids);
            }
        })
    }

    /// Remove a previously registered change handler.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.cells.unobserve(handle);
    }

    /// The underlying cell store.
    pub fn cells(&self) -> &CellStore {
        &self.cells
    }
}

impl std::fmt::Debug for RowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStore")
            .field("rows", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use yrs::Doc;

    fn create_rows() -> RowStore {
        let doc = Doc::new();
        RowStore::new(CellStore::new(&doc, "table:test"))
    }

    #[test]
    fn test_get_reconstructs_row() {
        let rows = create_rows();
        rows.cells().set_cell("r1", "title", json!("hello"));
        rows.cells().set_cell("r1", "views", json!(3));
        rows.cells().set_cell("r2", "title", json!("other"));

        let row = rows.get("r1").unwrap();
        assert_eq!(row.get("title"), Some(&json!("hello")));
        assert_eq!(row.get("views"), Some(&json!(3)));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_get_missing_row_is_none() {
        let rows = create_rows();
        assert!(rows.get("nope").is_none());
    }

    #[test]
    fn test_has_rejects_prefix_collisions() {
        let rows = create_rows();
        rows.cells().set_cell("ab", "x", json!(1));

        assert!(rows.has("ab"));
        assert!(!rows.has("a"));
    }

    #[test]
    fn test_ids_and_count_deduplicate() {
        let rows = create_rows();
        rows.cells().set_cell("r2", "a", json!(1));
        rows.cells().set_cell("r1", "a", json!(1));
        rows.cells().set_cell("r1", "b", json!(2));

        assert_eq!(rows.ids(), vec!["r1".to_string(), "r2".to_string()]);
        assert_eq!(rows.count(), 2);
    }

    #[test]
    fn test_get_all_assembles_rows() {
        let rows = create_rows();
        rows.cells().set_cell("r1", "a", json!(1));
        rows.cells().set_cell("r2", "a", json!(2));
        rows.cells().set_cell("r2", "b", json!(3));

        let all = rows.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "r1");
        assert_eq!(all[1].0, "r2");
        assert_eq!(all[1].1.len(), 2);
    }

    #[test]
    fn test_delete_removes_all_cells_in_one_event() {
        let rows = create_rows();
        rows.cells().set_cell("r1", "a", json!(1));
        rows.cells().set_cell("r1", "b", json!(2));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _h = rows.observe(move |ids| {
            sink.lock().unwrap().push(ids.clone());
        });

        rows.delete("r1");

        assert!(rows.get("r1").is_none());
        assert!(!rows.has("r1"));
        let fired = events.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].contains("r1"));
    }

    #[test]
    fn test_delete_unknown_row_is_noop() {
        let rows = create_rows();
        rows.delete("ghost");
        assert_eq!(rows.count(), 0);
    }

    #[test]
    fn test_observe_fires_once_per_transaction() {
        let rows = create_rows();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _h = rows.observe(move |ids| {
            sink.lock().unwrap().push(ids.clone());
        });

        rows.cells().batch(|tx| {
            tx.set_cell("r1", "a", json!(1));
            tx.set_cell("r2", "a", json!(2));
        });

        let fired = events.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(
            fired[0].iter().cloned().collect::<Vec<_>>(),
            vec!["r1".to_string(), "r2".to_string()]
        );
    }

    #[test]
    fn test_get_none_iff_no_prefix_cells() {
        let rows = create_rows();
        rows.cells().set_cell("r1", "a", json!(1));
        assert!(rows.get("r1").is_some());
        rows.cells().delete_cell("r1", "a");
        assert!(rows.get("r1").is_none());
    }
}
