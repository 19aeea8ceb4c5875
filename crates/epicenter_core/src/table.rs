//! Schema-validated table and kv accessors.
//!
//! [`TableHelper`] synthesizes row-oriented tables on top of cell-granular
//! LWW entries; [`KvHelper`] does the same for a single named value. Both
//! follow the same error philosophy: reads are tolerant (schema problems come
//! back as [`GetResult::Invalid`], never as errors), writes are strict
//! (validation failures reject the whole write before any cell is touched).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value;
use yrs::Doc;

use crate::error::{Result, SchemaError, ValidationError};
use crate::kv::{ObserverHandle, YKeyValueLww};
use crate::schema::{KvSchema, TableSchema};
use crate::store::{CELL_SEPARATOR, CellStore, RowStore};

/// Array name prefix for per-table cell namespaces.
const TABLE_PREFIX: &str = "table:";

/// Shared array name for kv definitions.
const KV_ARRAY: &str = "kv";

/// Array name for a table's cell namespace.
pub(crate) fn table_array_name(name: &str) -> String {
    format!("{}{}", TABLE_PREFIX, name)
}

/// Tagged result of a schema-validated read.
#[derive(Debug, Clone)]
pub enum GetResult<R> {
    /// The stored value satisfied the newest schema version.
    Valid(R),
    /// The stored value exists but failed validation; the raw shape and the
    /// violations are returned for tolerant callers.
    Invalid {
        /// The (migrated) raw value as stored
        raw: Value,
        /// The schema violations
        errors: Vec<SchemaError>,
    },
    /// Nothing is stored under the requested identity.
    NotFound,
}

impl<R> GetResult<R> {
    /// The validated value, discarding invalid/missing results.
    pub fn valid(self) -> Option<R> {
        match self {
            GetResult::Valid(row) => Some(row),
            _ => None,
        }
    }

    /// Whether this result carries a validated value.
    pub fn is_valid(&self) -> bool {
        matches!(self, GetResult::Valid(_))
    }

    /// Whether nothing was stored.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GetResult::NotFound)
    }
}

/// Normalization for operations accepting one value or a batch of values.
#[derive(Debug, Clone)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),
    /// A batch of values.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// Normalize to a vector.
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(vs) => vs,
        }
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        OneOrMany::One(value)
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::Many(values)
    }
}

/// Schema-validated row accessor for one table.
pub struct TableHelper<S: TableSchema> {
    name: String,
    schema: Arc<S>,
    rows: RowStore,
}

impl<S: TableSchema> Clone for TableHelper<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            schema: Arc::clone(&self.schema),
            rows: self.rows.clone(),
        }
    }
}

impl<S: TableSchema> TableHelper<S> {
    /// Create a standalone table over `doc` (array `table:<name>`).
    pub fn new(doc: &Doc, name: &str, schema: S) -> Self {
        let cells = CellStore::new(doc, &table_array_name(name));
        Self::with_cells(name, schema, cells)
    }

    /// Create a table over an existing cell store (workspace-owned).
    pub(crate) fn with_cells(name: &str, schema: S, cells: CellStore) -> Self {
        Self {
            name: name.to_string(),
            schema: Arc::new(schema),
            rows: RowStore::new(cells),
        }
    }

    /// The table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read one row: migrate, then validate against the newest schema.
    pub fn get(&self, id: &str) -> GetResult<S::Row> {
        match self.rows.get(id) {
            None => GetResult::NotFound,
            Some(fields) => {
                let migrated = self.schema.migrate(Value::Object(fields));
                match self.schema.validate(&migrated) {
                    Ok(row) => GetResult::Valid(row),
                    Err(errors) => GetResult::Invalid {
                        raw: migrated,
                        errors,
                    },
                }
            }
        }
    }

    /// Every row as a tagged result, including invalid ones.
    pub fn get_all(&self) -> Vec<GetResult<S::Row>> {
        self.rows
            .ids()
            .iter()
            .map(|id| self.get(id))
            .collect()
    }

    /// Every row that validates.
    pub fn get_all_valid(&self) -> Vec<S::Row> {
        self.get_all()
            .into_iter()
            .filter_map(GetResult::valid)
            .collect()
    }

    /// Valid rows matching `pred`.
    pub fn filter(&self, pred: impl Fn(&S::Row) -> bool) -> Vec<S::Row> {
        self.get_all_valid()
            .into_iter()
            .filter(|row| pred(row))
            .collect()
    }

    /// Number of rows (valid or not).
    pub fn count(&self) -> usize {
        self.rows.count()
    }

    /// Write one row or a batch of rows.
    ///
    /// Every input is validated before any cell is touched; a rejected batch
    /// writes nothing. Stale columns (present in the stored row, absent from
    /// the new one) are deleted in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when a row violates its schema, does not
    /// serialize to an object, or uses the reserved `:` separator in its id
    /// or a field name.
    pub fn set(&self, rows: impl Into<OneOrMany<S::Row>>) -> Result<()> {
        use crate::schema::RowRecord;

        let rows = rows.into().into_vec();
        let mut prepared = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Err(errors) = self.schema.check(row) {
                return Err(ValidationError::new(&self.name, errors).into());
            }
            let raw = serde_json::to_value(row).map_err(|e| {
                ValidationError::new(&self.name, vec![SchemaError::root(e.to_string())])
            })?;
            let Value::Object(fields) = raw else {
                return Err(ValidationError::new(
                    &self.name,
                    vec![SchemaError::root("row must serialize to an object")],
                )
                .into());
            };
            let id = row.row_id().to_string();
            if id.contains(CELL_SEPARATOR) {
                return Err(ValidationError::new(
                    &self.name,
                    vec![SchemaError::new("id", "must not contain ':'")],
                )
                .into());
            }
            if let Some(bad) = fields.keys().find(|k| k.contains(CELL_SEPARATOR)) {
                return Err(ValidationError::new(
                    &self.name,
                    vec![SchemaError::new(bad.clone(), "field name must not contain ':'")],
                )
                .into());
            }
            prepared.push((id, fields));
        }

        self.rows.cells().batch(|tx| {
            for (id, fields) in prepared {
                let existing: Vec<String> = self
                    .rows
                    .get(&id)
                    .map(|stored| stored.keys().cloned().collect())
                    .unwrap_or_default();
                for column in existing {
                    if !fields.contains_key(&column) {
                        tx.delete_cell(&id, &column);
                    }
                }
                for (column, value) in fields {
                    tx.set_cell(&id, &column, value);
                }
            }
        });
        Ok(())
    }

    /// Delete one row or a batch of rows by id. A no-op for unknown ids.
    pub fn delete(&self, ids: impl Into<OneOrMany<String>>) {
        let ids = ids.into().into_vec();
        self.rows.cells().batch(|_tx| {
            for id in &ids {
                self.rows.delete(id);
            }
        });
    }

    /// Register a change handler: fires once per committed transaction with
    /// the set of affected row ids.
    pub fn observe(&self, f: impl Fn(&BTreeSet<String>) + Send + Sync + 'static) -> ObserverHandle {
        self.rows.observe(f)
    }

    /// Remove a previously registered change handler.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.rows.unobserve(handle);
    }

    /// The underlying row store.
    pub fn rows(&self) -> &RowStore {
        &self.rows
    }
}

impl<S: TableSchema> std::fmt::Debug for TableHelper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHelper")
            .field("name", &self.name)
            .field("rows", &self.count())
            .finish()
    }
}

/// Schema-validated accessor for a single named value.
pub struct KvHelper<S: KvSchema> {
    name: String,
    schema: Arc<S>,
    kv: YKeyValueLww<Value>,
}

impl<S: KvSchema> Clone for KvHelper<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            schema: Arc::clone(&self.schema),
            kv: self.kv.clone(),
        }
    }
}

impl<S: KvSchema> KvHelper<S> {
    /// Create a standalone kv accessor over `doc` (shared array `kv`).
    pub fn new(doc: &Doc, name: &str, schema: S) -> Self {
        Self::with_kv(name, schema, YKeyValueLww::new(doc, KV_ARRAY))
    }

    /// Create a kv accessor over an existing store (workspace-owned).
    pub(crate) fn with_kv(name: &str, schema: S, kv: YKeyValueLww<Value>) -> Self {
        Self {
            name: name.to_string(),
            schema: Arc::new(schema),
            kv,
        }
    }

    /// The kv definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the value: migrate, then validate against the newest version.
    pub fn get(&self) -> GetResult<S::Value> {
        match self.kv.get(&self.name) {
            None => GetResult::NotFound,
            Some(raw) => {
                let migrated = self.schema.migrate(raw);
                match self.schema.validate(&migrated) {
                    Ok(value) => GetResult::Valid(value),
                    Err(errors) => GetResult::Invalid {
                        raw: migrated,
                        errors,
                    },
                }
            }
        }
    }

    /// Replace the value. Values are whole objects; there is no partial
    /// update at this level.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the value violates its schema.
    pub fn set(&self, value: S::Value) -> Result<()> {
        if let Err(errors) = self.schema.check(&value) {
            return Err(ValidationError::new(&self.name, errors).into());
        }
        let raw = serde_json::to_value(&value).map_err(|e| {
            ValidationError::new(&self.name, vec![SchemaError::root(e.to_string())])
        })?;
        self.kv.set(self.name.clone(), raw);
        Ok(())
    }

    /// Remove the value. A no-op if absent.
    pub fn delete(&self) {
        self.kv.delete(&self.name);
    }

    /// Register a change handler for this definition's key.
    pub fn observe(&self, f: impl Fn() + Send + Sync + 'static) -> ObserverHandle {
        let name = self.name.clone();
        self.kv.observe(move |changes| {
            if changes.contains_key(&name) {
                f();
            }
        })
    }

    /// Remove a previously registered change handler.
    pub fn unobserve(&self, handle: ObserverHandle) {
        self.kv.unobserve(handle);
    }
}

impl<S: KvSchema> std::fmt::Debug for KvHelper<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvHelper").field("name", &self.name).finish()
    }
}
