use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::value::IndexValue;

/// The kinds of index a collection can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Hash,
    Skiplist,
    Fulltext,
    Geo,
    /// Cap constraint: bounds the number of documents in the collection.
    Cap,
    PriorityQueue,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IndexKind::Hash => "hash",
            IndexKind::Skiplist => "skiplist",
            IndexKind::Fulltext => "fulltext",
            IndexKind::Geo => "geo",
            IndexKind::Cap => "cap",
            IndexKind::PriorityQueue => "priorityqueue",
        };
        f.write_str(name)
    }
}

/// A request to build an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub kind: IndexKind,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    /// Maximum document count, for cap constraints.
    #[serde(default)]
    pub size: Option<u32>,
}

impl IndexDefinition {
    fn with_fields(kind: IndexKind, fields: &[&str], unique: bool) -> Self {
        Self {
            kind,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique,
            size: None,
        }
    }

    pub fn hash(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Hash, fields, false)
    }

    pub fn unique_hash(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Hash, fields, true)
    }

    pub fn skiplist(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Skiplist, fields, false)
    }

    pub fn unique_skiplist(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Skiplist, fields, true)
    }

    pub fn fulltext(field: &str) -> Self {
        Self::with_fields(IndexKind::Fulltext, &[field], false)
    }

    pub fn geo(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Geo, fields, false)
    }

    pub fn geo_constraint(fields: &[&str]) -> Self {
        Self::with_fields(IndexKind::Geo, fields, true)
    }

    pub fn priority_queue(field: &str) -> Self {
        Self::with_fields(IndexKind::PriorityQueue, &[field], false)
    }

    pub fn cap(size: u32) -> Self {
        Self {
            kind: IndexKind::Cap,
            fields: Vec::new(),
            unique: false,
            size: Some(size),
        }
    }
}

/// Metadata about an index on a collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexInfo {
    pub id: String,
    pub kind: IndexKind,
    pub fields: Vec<String>,
    pub unique: bool,
    pub size: Option<u32>,
}

// ---------------------------------------------------------------------------
// Hash / skiplist index
// ---------------------------------------------------------------------------

/// Ordered index over one or more document fields. Serves both hash and
/// skiplist definitions. Documents lacking any indexed field are not indexed.
#[derive(Debug)]
pub struct FieldIndex {
    pub fields: Vec<String>,
    pub unique: bool,
    tree: BTreeMap<Vec<IndexValue>, BTreeSet<String>>,
}

impl FieldIndex {
    pub fn new(fields: Vec<String>, unique: bool) -> Self {
        Self {
            fields,
            unique,
            tree: BTreeMap::new(),
        }
    }

    fn index_key(&self, doc: &Document) -> Option<Vec<IndexValue>> {
        self.fields
            .iter()
            .map(|f| doc.get_field(f).map(|v| IndexValue::from_json(&v)))
            .collect()
    }

    /// True if inserting `doc` would collide with a different document.
    pub fn violates_unique(&self, doc: &Document) -> bool {
        if !self.unique {
            return false;
        }
        let Some(key) = self.index_key(doc) else {
            return false;
        };
        self.tree
            .get(&key)
            .is_some_and(|keys| keys.iter().any(|k| *k != doc.key))
    }

    pub fn insert(&mut self, doc: &Document) {
        if let Some(key) = self.index_key(doc) {
            self.tree.entry(key).or_default().insert(doc.key.clone());
        }
    }

    pub fn remove(&mut self, doc: &Document) {
        if let Some(key) = self.index_key(doc) {
            if let Some(set) = self.tree.get_mut(&key) {
                set.remove(&doc.key);
                if set.is_empty() {
                    self.tree.remove(&key);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.tree.clear();
    }

    /// Only single-field indexes answer point and range lookups.
    pub fn covers(&self, field: &str) -> bool {
        self.fields.len() == 1 && self.fields[0] == field
    }

    pub fn find_eq(&self, value: &IndexValue) -> BTreeSet<String> {
        self.tree
            .get(std::slice::from_ref(value))
            .cloned()
            .unwrap_or_default()
    }

    pub fn find_range(&self, start: Bound<&IndexValue>, end: Bound<&IndexValue>) -> BTreeSet<String> {
        let start = start.map(|v| vec![v.clone()]);
        let end = end.map(|v| vec![v.clone()]);
        let mut result = BTreeSet::new();
        for (_key, keys) in self.tree.range((start, end)) {
            result.extend(keys.iter().cloned());
        }
        result
    }

    pub fn find_in(&self, values: &[IndexValue]) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        for v in values {
            result.extend(self.find_eq(v));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.tree.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
