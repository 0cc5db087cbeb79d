use crate::core::StorageType;
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// A single cell as produced by a parser.
///
/// Compound values (objects, arrays) never reach a record as structures:
/// parsers serialize them and keep the text in [`Value::Json`].
///
/// Serializes as the bare cell value for reports and job snapshots. It is
/// write-only: `Text` and `Json` serialize alike, so there is no
/// `Deserialize`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Json(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null, or text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Converts a parsed JSON value, serializing objects and arrays.
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(s) => Value::Text(s),
            compound @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
                Value::Json(compound.to_string())
            }
        }
    }

    /// Adapts a value to the column it is about to be stored in.
    ///
    /// Text that parses as the column's numeric type is converted, blank
    /// text in a numeric column becomes null, and anything else is kept
    /// as-is so a late type violation never fails the batch.
    pub fn coerce_for(&self, storage: StorageType) -> Cow<'_, Value> {
        match (storage, self) {
            (StorageType::Integer | StorageType::Real, Value::Text(s)) if s.trim().is_empty() => {
                Cow::Owned(Value::Null)
            }
            (StorageType::Integer, Value::Text(s)) => {
                let stripped = strip_separators(s);
                if let Ok(i) = stripped.parse::<i64>() {
                    Cow::Owned(Value::Integer(i))
                } else if let Ok(f) = stripped.parse::<f64>() {
                    Cow::Owned(Value::Float(f))
                } else {
                    Cow::Borrowed(self)
                }
            }
            (StorageType::Real, Value::Text(s)) => match strip_separators(s).parse::<f64>() {
                Ok(f) => Cow::Owned(Value::Float(f)),
                Err(_) => Cow::Borrowed(self),
            },
            (StorageType::Integer, Value::Boolean(b)) => Cow::Owned(Value::Integer(i64::from(*b))),
            _ => Cow::Borrowed(self),
        }
    }
}

/// Removes thousands separators and surrounding whitespace.
pub(crate) fn strip_separators(raw: &str) -> String {
    raw.trim().chars().filter(|c| *c != ',').collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) | Value::Json(s) => write!(f, "{s}"),
            Value::Blob(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) | Value::Json(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
        })
    }
}

/// One logical row, keyed by destination column name.
///
/// Columns absent from `data` are read back as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Record {
    pub data: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: HashMap::with_capacity(capacity),
        }
    }

    pub fn with_data(data: HashMap<String, Value>) -> Self {
        Self { data }
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.data.insert(name.into(), value);
    }

    pub fn get_field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn value_or_null(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.data.get(name).unwrap_or(&NULL)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The unit moved between a parser and a destination.
pub type Batch = Vec<Record>;
