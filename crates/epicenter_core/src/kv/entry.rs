//! Entry envelope and positional-delta helpers shared by the KV stores.
//!
//! Entries live in the underlying CRDT array as atomic `Any` maps:
//! `{ "key": string, "val": any }` for the append-log store, plus a
//! `"ts": int` field for the last-write-wins store. Atomic values (rather
//! than nested shared types) keep every entry immutable once pushed, which is
//! what makes positional and timestamp tiebreaks well defined.

use std::collections::{HashMap, HashSet};

use yrs::types::Change;
use yrs::{Any, Array, ArrayRef, Out, ReadTxn, TransactionMut};

const KEY_FIELD: &str = "key";
const VAL_FIELD: &str = "val";
const TS_FIELD: &str = "ts";

/// A key/value entry of the last-write-wins store, as surfaced by
/// [`crate::kv::YKeyValueLww::entries`].
#[derive(Debug, Clone, PartialEq)]
pub struct LwwEntry<T> {
    /// The stored value
    pub val: T,
    /// Monotonic logical timestamp assigned at write time
    pub ts: i64,
}

/// A semantic change to one key, delivered to store observers.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryChange<T> {
    /// The key was not present before this transaction.
    Added {
        /// Value now visible for the key
        new: T,
    },
    /// The key was present and its winning value changed.
    Updated {
        /// Previously visible value
        old: T,
        /// Value now visible for the key
        new: T,
    },
    /// The key is no longer present.
    Removed {
        /// Value that was visible before removal
        old: T,
    },
}

impl<T> EntryChange<T> {
    /// The value visible after this change, if any.
    pub fn new_value(&self) -> Option<&T> {
        match self {
            EntryChange::Added { new } | EntryChange::Updated { new, .. } => Some(new),
            EntryChange::Removed { .. } => None,
        }
    }

    /// The value visible before this change, if any.
    pub fn old_value(&self) -> Option<&T> {
        match self {
            EntryChange::Updated { old, .. } | EntryChange::Removed { old } => Some(old),
            EntryChange::Added { .. } => None,
        }
    }
}

/// Decoded form of one in-array entry.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub key: String,
    pub val: Any,
    pub ts: Option<i64>,
}

impl RawEntry {
    /// Build the atomic `Any` envelope pushed into the array.
    pub(crate) fn encode(key: &str, val: Any, ts: Option<i64>) -> Any {
        let mut fields = HashMap::with_capacity(if ts.is_some() { 3 } else { 2 });
        fields.insert(KEY_FIELD.to_string(), Any::String(key.into()));
        fields.insert(VAL_FIELD.to_string(), val);
        if let Some(ts) = ts {
            fields.insert(TS_FIELD.to_string(), Any::BigInt(ts));
        }
        Any::Map(fields.into())
    }

    /// Decode an array slot; `None` for foreign or malformed values.
    pub(crate) fn decode(out: &Out) -> Option<RawEntry> {
        let Out::Any(Any::Map(fields)) = out else {
            return None;
        };
        let key = match fields.get(KEY_FIELD) {
            Some(Any::String(s)) => s.to_string(),
            _ => return None,
        };
        let val = fields.get(VAL_FIELD)?.clone();
        let ts = match fields.get(TS_FIELD) {
            Some(Any::BigInt(i)) => Some(*i),
            Some(Any::Number(n)) => Some(*n as i64),
            _ => None,
        };
        Some(RawEntry { key, val, ts })
    }

    /// Cheap key-only extraction for positional scans.
    pub(crate) fn key_of(out: &Out) -> Option<String> {
        let Out::Any(Any::Map(fields)) = out else {
            return None;
        };
        match fields.get(KEY_FIELD) {
            Some(Any::String(s)) => Some(s.to_string()),
            _ => None,
        }
    }
}

/// Replay a positional delta onto `order`, the mirror of entry keys by array
/// index. The mirror is mutated in place to the post-transaction order;
/// returns the set of keys whose positions changed.
///
/// Foreign (undecodable) slots get an empty-string placeholder so later
/// positions stay aligned; such slots are never surfaced as keys.
pub(crate) fn apply_delta(order: &mut Vec<String>, delta: &[Change]) -> HashSet<String> {
    let mut touched = HashSet::new();
    let mut pos = 0usize;
    for change in delta {
        match change {
            Change::Retain(n) => pos += *n as usize,
            Change::Removed(n) => {
                let end = (pos + *n as usize).min(order.len());
                for key in order.drain(pos..end) {
                    if !key.is_empty() {
                        touched.insert(key);
                    }
                }
            }
            Change::Added(values) => {
                for out in values {
                    match RawEntry::key_of(out) {
                        Some(key) => {
                            touched.insert(key.clone());
                            order.insert(pos, key);
                        }
                        None => {
                            log::warn!("kv array received a non-entry value; ignoring");
                            order.insert(pos, String::new());
                        }
                    }
                    pos += 1;
                }
            }
        }
    }
    touched
}

/// All positions (ascending) currently holding `key` in the mirror.
pub(crate) fn positions_of(order: &[String], key: &str) -> Vec<usize> {
    order
        .iter()
        .enumerate()
        .filter_map(|(i, k)| (k == key).then_some(i))
        .collect()
}

/// All array indices (ascending) currently holding an entry for `key`.
pub(crate) fn entry_positions<T: ReadTxn>(array: &ArrayRef, txn: &T, key: &str) -> Vec<u32> {
    array
        .iter(txn)
        .enumerate()
        .filter_map(|(i, out)| match RawEntry::key_of(&out) {
            Some(k) if k == key => Some(i as u32),
            _ => None,
        })
        .collect()
}

/// Remove every in-array entry for `key`; returns how many were removed.
pub(crate) fn remove_entries_for_key(
    array: &ArrayRef,
    txn: &mut TransactionMut,
    key: &str,
) -> usize {
    let positions = entry_positions(array, &*txn, key);
    for &index in positions.iter().rev() {
        array.remove(txn, index);
    }
    positions.len()
}
