//! Schema capabilities for tables and kv definitions.
//!
//! A schema does two things: it *validates* a raw stored value against its
//! newest version, and it names the static type the validated value carries
//! (the associated `Row`/`Value` type). Validation is serde-backed by
//! default, so deriving `Serialize`/`Deserialize` on a row struct is enough
//! for the common single-version case.
//!
//! # Versioning
//!
//! Three recognized patterns, all expressed with serde plus the [`migrate`]
//! hook (applied on read, before validation; writes always use the newest
//! shape):
//!
//! 1. **Field presence** — a new version adds a field; `#[serde(default)]`
//!    absorbs older rows.
//! 2. **Asymmetric `_v`** (recommended default) — the initial version has no
//!    `_v`; each subsequent version carries a literal discriminant. The
//!    migration closure inspects `_v` (missing = v1) and rewrites the value
//!    up to the newest shape.
//! 3. **Symmetric `_v`** — every version carries `_v`; same mechanics.
//!
//! ```ignore
//! let schema = Versioned::new(TypedSchema::<PostV2>::new(), |mut raw| {
//!     let is_v1 = raw.get("_v").is_none();
//!     if is_v1 && let Some(obj) = raw.as_object_mut() {
//!         obj.insert("_v".into(), 2.into());
//!         obj.insert("tags".into(), serde_json::json!([]));
//!     }
//!     raw
//! });
//! ```
//!
//! [`migrate`]: TableSchema::migrate

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SchemaError;

/// A value that can live in a table row: serde round-trip plus a stable
/// row identity.
pub trait RowRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// The row's identity within its table.
    fn row_id(&self) -> &str;
}

/// Schema capability for a table: validate raw rows and up-migrate older
/// stored shapes.
pub trait TableSchema: Send + Sync + 'static {
    /// The static type of a validated row.
    type Row: RowRecord;

    /// Up-migrate an older stored shape to the newest version. Applied on
    /// read before validation; never written back by the read path.
    fn migrate(&self, raw: Value) -> Value {
        raw
    }

    /// Validate a raw row against the newest version.
    fn validate(&self, raw: &Value) -> Result<Self::Row, Vec<SchemaError>> {
        serde_json::from_value(raw.clone()).map_err(|e| vec![serde_schema_error(&e)])
    }

    /// Extra write-time invariants beyond shape. Defaults to none.
    fn check(&self, _row: &Self::Row) -> Result<(), Vec<SchemaError>> {
        Ok(())
    }
}

/// Schema capability for a single named kv value.
pub trait KvSchema: Send + Sync + 'static {
    /// The static type of the validated value.
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    /// Up-migrate an older stored shape to the newest version.
    fn migrate(&self, raw: Value) -> Value {
        raw
    }

    /// Validate a raw value against the newest version.
    fn validate(&self, raw: &Value) -> Result<Self::Value, Vec<SchemaError>> {
        serde_json::from_value(raw.clone()).map_err(|e| vec![serde_schema_error(&e)])
    }

    /// Extra write-time invariants beyond shape. Defaults to none.
    fn check(&self, _value: &Self::Value) -> Result<(), Vec<SchemaError>> {
        Ok(())
    }
}

fn serde_schema_error(err: &serde_json::Error) -> SchemaError {
    SchemaError::root(err.to_string())
}

/// The single-version shorthand: serde derive *is* the schema.
pub struct TypedSchema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedSchema<T> {
    /// Create the shorthand schema for `T`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TypedSchema<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<R: RowRecord> TableSchema for TypedSchema<R> {
    type Row = R;
}

impl<V> KvSchema for TypedSchema<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    type Value = V;
}

/// Wraps another schema with an up-migration applied before validation.
///
/// The inner schema validates the *newest* shape; the migration closure is
/// responsible for recognizing older shapes (field presence or a `_v`
/// discriminant) and rewriting them upward.
pub struct Versioned<S> {
    inner: S,
    migrate: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl<S> Versioned<S> {
    /// Wrap `inner` with the given up-migration.
    pub fn new(inner: S, migrate: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self {
            inner,
            migrate: Arc::new(migrate),
        }
    }
}

impl<S: TableSchema> TableSchema for Versioned<S> {
    type Row = S::Row;

    fn migrate(&self, raw: Value) -> Value {
        self.inner.migrate((self.migrate)(raw))
    }

    fn validate(&self, raw: &Value) -> Result<Self::Row, Vec<SchemaError>> {
        self.inner.validate(raw)
    }

    fn check(&self, row: &Self::Row) -> Result<(), Vec<SchemaError>> {
        self.inner.check(row)
    }
}

impl<S: KvSchema> KvSchema for Versioned<S> {
    type Value = S::Value;

    fn migrate(&self, raw: Value) -> Value {
        self.inner.migrate((self.migrate)(raw))
    }

    fn validate(&self, raw: &Value) -> Result<Self::Value, Vec<SchemaError>> {
        self.inner.validate(raw)
    }

    fn check(&self, value: &Self::Value) -> Result<(), Vec<SchemaError>> {
        self.inner.check(value)
    }
}
