pub mod condition;

pub use condition::{Condition, ConditionActual};

use crate::error::{Result, StoreError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Field holding a store-level expiry, in epoch seconds.
pub const TTL_FIELD: &str = "ttl";

pub type Fields = BTreeMap<String, AttrValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Number(i64),
    Float(f64),
    Text(String),
    Binary(Vec<u8>),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    fn kind_rank(&self) -> u8 {
        match self {
            AttrValue::Null => 0,
            AttrValue::Bool(_) => 1,
            AttrValue::Number(_) => 2,
            AttrValue::Float(_) => 3,
            AttrValue::Text(_) => 4,
            AttrValue::Binary(_) => 5,
            AttrValue::List(_) => 6,
            AttrValue::Map(_) => 7,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;
        match self {
            AttrValue::Null => Json::Null,
            AttrValue::Bool(b) => Json::Bool(*b),
            AttrValue::Number(n) => Json::from(*n),
            AttrValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            AttrValue::Text(s) => Json::String(s.clone()),
            // Binary has no JSON form of its own and comes back as a list of numbers.
            AttrValue::Binary(bytes) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
            AttrValue::List(items) => Json::Array(items.iter().map(AttrValue::to_json).collect()),
            AttrValue::Map(map) => Json::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => AttrValue::Null,
            Json::Bool(b) => AttrValue::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Number(i),
                None => AttrValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => AttrValue::Text(s),
            Json::Array(items) => {
                AttrValue::List(items.into_iter().map(AttrValue::from_json).collect())
            }
            Json::Object(map) => AttrValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, AttrValue::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AttrValue {}

impl PartialOrd for AttrValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttrValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (AttrValue::Null, AttrValue::Null) => Ordering::Equal,
            (AttrValue::Bool(a), AttrValue::Bool(b)) => a.cmp(b),
            (AttrValue::Number(a), AttrValue::Number(b)) => a.cmp(b),
            (AttrValue::Float(a), AttrValue::Float(b)) => a.total_cmp(b),
            (AttrValue::Text(a), AttrValue::Text(b)) => a.cmp(b),
            (AttrValue::Binary(a), AttrValue::Binary(b)) => a.cmp(b),
            (AttrValue::List(a), AttrValue::List(b)) => a.cmp(b),
            (AttrValue::Map(a), AttrValue::Map(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Number(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(AttrValue::Number)
            .unwrap_or(AttrValue::Float(value as f64))
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<Vec<AttrValue>> for AttrValue {
    fn from(value: Vec<AttrValue>) -> Self {
        AttrValue::List(value)
    }
}

/// Composite address of a record: partition key plus sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl RecordKey {
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
        }
    }

    /// Smallest key within `partition_key`, used as a scan start.
    pub(crate) fn partition_start(partition_key: &str) -> Self {
        Self::new(partition_key, "")
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.partition_key, self.sort_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: Fields,
}

impl Record {
    pub fn new(key: RecordKey, fields: Fields) -> Self {
        Self { key, fields }
    }

    pub fn project(&self, projection: Option<&[String]>) -> Fields {
        project_fields(&self.fields, projection)
    }
}

pub(crate) fn project_fields(fields: &Fields, projection: Option<&[String]>) -> Fields {
    match projection {
        None => fields.clone(),
        Some(names) => names
            .iter()
            .filter_map(|name| fields.get(name).map(|v| (name.clone(), v.clone())))
            .collect(),
    }
}

/// True when the record carries a `ttl` that has already passed.
pub(crate) fn is_expired(fields: &Fields, now_secs: u64) -> bool {
    match fields.get(TTL_FIELD).and_then(AttrValue::as_number) {
        Some(ttl) => ttl >= 0 && (ttl as u64) < now_secs,
        None => false,
    }
}

/// Field-level change set applied by one conditional update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldUpdate {
    pub set: Fields,
    pub remove: Vec<String>,
}

impl FieldUpdate {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set.insert(field.into(), value.into());
        self
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.remove.push(field.into());
        self
    }

    pub(crate) fn apply_to(&self, fields: &mut Fields) {
        for name in &self.remove {
            fields.remove(name);
        }
        for (name, value) in &self.set {
            fields.insert(name.clone(), value.clone());
        }
    }
}

/// Marshals a serializable struct into a field set. `None`/null members are
/// left out rather than stored as explicit nulls.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value).map_err(|e| StoreError::Encode(e.to_string()))? {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k, AttrValue::from_json(v)))
            .collect()),
        other => Err(StoreError::Encode(format!(
            "expected a struct-like value, got {other}"
        ))),
    }
}

pub fn from_fields<T: DeserializeOwned>(fields: &Fields) -> Result<T> {
    let object: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::from_value(serde_json::Value::Object(object))
        .map_err(|e| StoreError::Decode(e.to_string()))
}
