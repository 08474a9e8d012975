//! Core identity and value types shared across the coordination layer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Stable identity of an object in the store.
///
/// Allocated once by the store handle and never reused; the same logical
/// entity carries the same `ObjectId` in every context and on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of an entity type in the schema.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName(pub String);

impl EntityName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// (entity type, object identity) pair, the key for all per-context bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub entity: EntityName,
    pub id: ObjectId,
}

impl ObjectKey {
    pub fn new(entity: EntityName, id: ObjectId) -> Self {
        Self { entity, id }
    }
}

/// A typed field value on a stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Ordered comparison for predicate evaluation. Cross-type comparisons
    /// (other than Int/Float) are undefined and return `None`.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        use Value::*;
        match (self, other) {
            (Null, Null) => Some(std::cmp::Ordering::Equal),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Float(a), Float(b)) => a.partial_cmp(b),
            (Int(a), Float(b)) => (*a as f64).partial_cmp(b),
            (Float(a), Int(b)) => a.partial_cmp(&(*b as f64)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Canonical text encoding used as an import-cache key.
    ///
    /// The encoding is prefixed per variant so `Int(1)` and `Text("1")`
    /// never collide.
    pub fn lookup_key(&self) -> String {
        match self {
            Value::Null => "n:".to_string(),
            Value::Bool(b) => format!("b:{}", b),
            Value::Int(i) => format!("i:{}", i),
            Value::Float(f) => format!("f:{:016x}", f.to_bits()),
            Value::Text(s) => format!("t:{}", s),
            Value::Timestamp(ts) => {
                format!("ts:{}", ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
            }
        }
    }

    /// Convert a JSON scalar into a `Value`. Objects and arrays have no
    /// scalar representation and return `None`.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            _ => None,
        }
    }
}

/// Materialized field set of one object.
pub type Fields = BTreeMap<String, Value>;

/// One value in an external record: a scalar, a nested record, or a list
/// of nested records.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Scalar(Value),
    Object(Record),
    List(Vec<Record>),
}

/// A string-keyed external record, e.g. one deserialized JSON object,
/// prior to field mapping.
pub type Record = BTreeMap<String, RecordValue>;

/// Build a [`Record`] from a JSON object. Returns `None` if `json` is not
/// an object or contains a list of non-objects.
pub fn record_from_json(json: &serde_json::Value) -> Option<Record> {
    let map = json.as_object()?;
    let mut record = Record::new();
    for (key, value) in map {
        let rv = match value {
            serde_json::Value::Object(_) => RecordValue::Object(record_from_json(value)?),
            serde_json::Value::Array(items) => {
                let mut nested = Vec::with_capacity(items.len());
                for item in items {
                    nested.push(record_from_json(item)?);
                }
                RecordValue::List(nested)
            }
            scalar => RecordValue::Scalar(Value::from_json(scalar)?),
        };
        record.insert(key.clone(), rv);
    }
    Some(record)
}

/// Scalar view of a record field, ignoring nested values.
pub fn record_scalar<'a>(record: &'a Record, key: &str) -> Option<&'a Value> {
    match record.get(key) {
        Some(RecordValue::Scalar(v)) => Some(v),
        _ => None,
    }
}
