//! Conversions between `serde_json::Value` and the CRDT's `Any` scalar tree.
//!
//! KV entries and cell values are JSON-serializable; the underlying array
//! stores them as atomic [`Any`] values. These helpers keep the mapping in one
//! place so every store agrees on how numbers, buffers and maps round-trip.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use yrs::Any;

use crate::error::{EpicenterError, Result};

/// Convert a JSON value into an `Any` tree.
///
/// Integers that fit `i64` become `Any::BigInt` so they survive the round
/// trip without floating-point drift; everything else maps structurally.
pub(crate) fn value_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(value_to_any).collect();
            Any::Array(converted.into())
        }
        Value::Object(fields) => {
            let converted: HashMap<String, Any> = fields
                .iter()
                .map(|(k, v)| (k.clone(), value_to_any(v)))
                .collect();
            Any::Map(converted.into())
        }
    }
}

/// Convert an `Any` tree back into a JSON value.
///
/// `Undefined` collapses to `Null`; buffers become arrays of byte values
/// (buffers never appear in cell values, only in content timelines, so the
/// lossy direction is not exercised by the stores).
pub(crate) fn any_to_value(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::Number((*b).into())).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_value).collect()),
        Any::Map(fields) => {
            let mut object = serde_json::Map::new();
            for (k, v) in fields.iter() {
                object.insert(k.clone(), any_to_value(v));
            }
            Value::Object(object)
        }
    }
}

/// Serialize a typed value into an `Any` tree.
pub(crate) fn to_any<T: Serialize>(value: &T) -> Result<Any> {
    let json = serde_json::to_value(value)
        .map_err(|e| EpicenterError::Crdt(format!("failed to serialize value: {}", e)))?;
    Ok(value_to_any(&json))
}

/// Deserialize a typed value out of an `Any` tree.
pub(crate) fn from_any<T: DeserializeOwned>(any: &Any) -> Result<T> {
    serde_json::from_value(any_to_value(any))
        .map_err(|e| EpicenterError::Crdt(format!("failed to deserialize value: {}", e)))
}
