use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

use serde_json::Value as JsonValue;

/// Index value with type-aware ordering:
/// null < booleans < numbers < strings < arrays < objects.
#[derive(Debug, Clone)]
pub enum IndexValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Arrays, compared by their canonical JSON text.
    Array(String),
    /// Objects, compared by their canonical JSON text.
    Object(String),
}

impl Eq for IndexValue {}

impl Hash for IndexValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            IndexValue::Null => 0u8.hash(state),
            IndexValue::Boolean(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            // Integers and floats that compare equal must hash equal.
            IndexValue::Integer(i) => {
                2u8.hash(state);
                (*i as f64).to_bits().hash(state);
            }
            IndexValue::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            IndexValue::String(s) => {
                3u8.hash(state);
                s.hash(state);
            }
            IndexValue::Array(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            IndexValue::Object(s) => {
                5u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use IndexValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,

            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Integer(_) | Float(_), _) => Ordering::Less,
            (_, Integer(_) | Float(_)) => Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
            (String(_), _) => Ordering::Less,
            (_, String(_)) => Ordering::Greater,

            (Array(a), Array(b)) => a.cmp(b),
            (Array(_), _) => Ordering::Less,
            (_, Array(_)) => Ordering::Greater,

            (Object(a), Object(b)) => a.cmp(b),
        }
    }
}

impl IndexValue {
    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => IndexValue::Null,
            JsonValue::Bool(b) => IndexValue::Boolean(*b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexValue::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    IndexValue::Float(f)
                } else {
                    IndexValue::Null
                }
            }
            JsonValue::String(s) => IndexValue::String(s.clone()),
            JsonValue::Array(_) => IndexValue::Array(value.to_string()),
            JsonValue::Object(_) => IndexValue::Object(value.to_string()),
        }
    }
}
