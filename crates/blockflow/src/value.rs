//! Dynamic values carried by properties.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::arena::BlockId;
use crate::event::{ErrorEvent, Event};

/// Largest integer that survives an f64 round trip (2^53 - 1).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_991;
pub const MIN_SAFE_INTEGER: i64 = -MAX_SAFE_INTEGER;

/// Value held by a property.
///
/// Aggregates are `Arc`-wrapped: cloning is O(1) and identity (see
/// [`SameValue`]) is pointer identity, which is what change detection uses.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
    List(Arc<Vec<Value>>),
    Object(Arc<IndexMap<String, Value>>),
    /// Handle to a block, owned or merely referenced.
    Block(BlockId),
    Event(Event),
    Error(ErrorEvent),
}

/// Object.is-style identity used by dispatchers to decide whether a write is
/// a change.
pub trait SameValue {
    fn same(&self, other: &Self) -> bool;
}

impl SameValue for Value {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => {
                (a.is_nan() && b.is_nan()) || a.to_bits() == b.to_bits()
            }
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Block(a), Value::Block(b)) => a == b,
            (Value::Event(a), Value::Event(b)) => a.ptr_eq(b),
            (Value::Error(a), Value::Error(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl<T> SameValue for Option<Arc<T>> {
    fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Structural equality (lists and objects compare by content). Used by
/// diffing and tests; change detection uses [`SameValue`].
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => self.same(other),
        }
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(Arc::new(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Arc::new(fields.into_iter().map(|(k, v)| (k.into(), v)).collect()))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<BlockId> {
        match self {
            Value::Block(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// JavaScript-like truthiness, used by boolean configs (`#disabled`, `#sync`).
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Convert to JSON. Values with no persistent form (undefined, block
    /// handles, events) return `None`.
    pub fn to_json(&self) -> Option<Json> {
        match self {
            Value::Undefined | Value::Block(_) | Value::Event(_) | Value::Error(_) => None,
            Value::Null => Some(Json::Null),
            Value::Bool(b) => Some(Json::Bool(*b)),
            Value::Number(n) => Some(number_to_json(*n)),
            Value::String(s) => Some(Json::String(s.to_string())),
            Value::List(items) => Some(Json::Array(
                items.iter().map(|item| item.to_json().unwrap_or(Json::Null)).collect(),
            )),
            Value::Object(fields) => Some(Json::Object(
                fields
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
                    .collect(),
            )),
        }
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            Json::String(s) => Value::string(s),
            Json::Array(items) => Value::list(items.iter().map(Value::from_json)),
            Json::Object(fields) => {
                Value::object(fields.iter().map(|(k, v)| (k.clone(), Value::from_json(v))))
            }
        }
    }
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER as f64 && !(n == 0.0 && n.is_sign_negative()) {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Json::Number).unwrap_or(Json::Null)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::List(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(fields) => f.debug_map().entries(fields.iter()).finish(),
            Value::Block(id) => write!(f, "{id:?}"),
            Value::Event(event) => write!(f, "{event:?}"),
            Value::Error(error) => write!(f, "{error:?}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => Ok(()),
            Value::String(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Error(error) => write!(f, "{error}"),
            other => match other.to_json() {
                Some(json) => write!(f, "{json}"),
                None => write!(f, "{other:?}"),
            },
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s.into())
    }
}

impl From<BlockId> for Value {
    fn from(id: BlockId) -> Self {
        Value::Block(id)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        Value::Event(event)
    }
}

impl From<ErrorEvent> for Value {
    fn from(error: ErrorEvent) -> Self {
        Value::Error(error)
    }
}

impl From<&Json> for Value {
    fn from(json: &Json) -> Self {
        Value::from_json(json)
    }
}
