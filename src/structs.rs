use std::cmp::Ordering;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// --- Data Structures ---

/// A single cell as returned by a worker.
///
/// Workers speak JSON, so this mirrors the JSON scalar types. Anything that
/// is not a scalar (arrays, objects from json columns) is carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Other(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Numeric view of the value. Numeric strings count as numbers because
    /// workers render NUMERIC columns as text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Equality that treats `1` and `1.0` as the same value.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Integer(_) | Value::Float(_), Value::Integer(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            _ => self == other,
        }
    }

    /// Ordering used by MIN/MAX reduction and HAVING comparisons.
    ///
    /// Numbers compare numerically (numeric strings included), strings
    /// lexically, booleans false < true. Everything else is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => match (self.as_f64(), other.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => Some(a.cmp(b)),
            },
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Other(v) => write!(f, "{}", v),
        }
    }
}

/// One result row. Column order is preserved exactly as received, and
/// column names are unique within a row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    fields: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Row { fields: Vec::new() }
    }

    /// Sets a column, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Exact lookup first, then a case-insensitive pass over the keys.
    pub fn get_ignore_case(&self, name: &str) -> Option<&Value> {
        self.get(name).or_else(|| {
            self.fields
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, v)| v)
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (k, v) in iter {
            row.insert(k, v);
        }
        row
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct RowVisitor;

impl<'de> Visitor<'de> for RowVisitor {
    type Value = Row;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON object mapping column names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
        let mut row = Row::new();
        while let Some((key, value)) = access.next_entry::<String, Value>()? {
            row.insert(key, value);
        }
        Ok(row)
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Row, D::Error> {
        deserializer.deserialize_map(RowVisitor)
    }
}

/// Inclusive range of partition-column values covered by one sub-query.
/// `start > end` marks a partition that matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionRange {
    pub start: i64,
    pub end: i64,
}

impl PartitionRange {
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// One generated statement, ready to send to a worker. HAVING is never
/// part of `sql`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubQuery {
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<PartitionRange>,
}

/// Outcome of one worker call, indexed by the sub-query it answered.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResponse {
    pub partition: usize,
    pub ok: bool,
    pub rows: Vec<Row>,
    pub error_detail: Option<String>,
}

impl WorkerResponse {
    pub fn success(partition: usize, rows: Vec<Row>) -> Self {
        WorkerResponse {
            partition,
            ok: true,
            rows,
            error_detail: None,
        }
    }

    pub fn failure(partition: usize, detail: impl Into<String>) -> Self {
        WorkerResponse {
            partition,
            ok: false,
            rows: Vec::new(),
            error_detail: Some(detail.into()),
        }
    }
}
