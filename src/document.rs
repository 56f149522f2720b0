use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub type Revision = u64;

static KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_:.@()+,=;$!*'%-]{1,254}$").expect("static key pattern")
});

/// Attributes managed by the store. Never stored inside `fields`.
const SYSTEM_ATTRIBUTES: [&str; 3] = ["_key", "_id", "_rev"];

/// A stored document: its key, revision stamp and user fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub revision: Revision,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(key: String, revision: Revision, fields: Map<String, Value>) -> Self {
        Self { key, revision, fields }
    }

    /// Access a nested field using dot notation: "user.address.city".
    /// `_key` and `_rev` resolve to the system attributes.
    pub fn get_field(&self, path: &str) -> Option<Value> {
        match path {
            "_key" => return Some(Value::String(self.key.clone())),
            "_rev" => return Some(Value::String(self.revision.to_string())),
            _ => {}
        }
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    /// Render the document as JSON including the system attributes.
    pub fn to_value(&self, collection: &str) -> Value {
        let mut obj = Map::with_capacity(self.fields.len() + 3);
        obj.insert("_key".into(), Value::String(self.key.clone()));
        obj.insert("_id".into(), Value::String(format!("{}/{}", collection, self.key)));
        obj.insert("_rev".into(), Value::String(self.revision.to_string()));
        for (k, v) in &self.fields {
            obj.insert(k.clone(), v.clone());
        }
        Value::Object(obj)
    }

    pub fn meta(&self, collection: &str, old_revision: Option<Revision>) -> DocumentMeta {
        DocumentMeta {
            id: format!("{}/{}", collection, self.key),
            key: self.key.clone(),
            revision: self.revision,
            old_revision,
        }
    }
}

/// Identity of a document returned from mutating operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentMeta {
    pub id: String,
    pub key: String,
    pub revision: Revision,
    pub old_revision: Option<Revision>,
}

pub fn validate_key(key: &str) -> Result<()> {
    if KEY_PATTERN.is_match(key) {
        Ok(())
    } else {
        Err(Error::DocumentKeyBad(key.to_string()))
    }
}

/// Split a user-supplied body into its optional `_key` and the user fields.
pub fn split_body(body: Value) -> Result<(Option<String>, Map<String, Value>)> {
    let Value::Object(mut obj) = body else {
        return Err(Error::DocumentTypeInvalid);
    };
    let key = match obj.remove("_key") {
        None => None,
        Some(Value::String(k)) => {
            validate_key(&k)?;
            Some(k)
        }
        Some(other) => return Err(Error::DocumentKeyBad(other.to_string())),
    };
    for attr in SYSTEM_ATTRIBUTES {
        obj.remove(attr);
    }
    Ok((key, obj))
}

/// Merge `patch` into `target`. Nested objects are merged recursively;
/// `null` values remove the attribute unless `keep_null` is set.
pub fn merge_patch(target: &mut Map<String, Value>, patch: Map<String, Value>, keep_null: bool) {
    for (k, v) in patch {
        if SYSTEM_ATTRIBUTES.contains(&k.as_str()) {
            continue;
        }
        match v {
            Value::Null if !keep_null => {
                target.remove(&k);
            }
            Value::Object(sub) => match target.get_mut(&k) {
                Some(Value::Object(existing)) => merge_patch(existing, sub, keep_null),
                _ => {
                    target.insert(k, Value::Object(sub));
                }
            },
            other => {
                target.insert(k, other);
            }
        }
    }
}
