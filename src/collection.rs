use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cap::{self, CapConstraint};
use crate::document::{self, Document, Revision};
use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::fulltext::FulltextIndex;
use crate::index::{FieldIndex, IndexDefinition, IndexInfo, IndexKind};
use crate::undo::UndoEntry;

enum IndexStore {
    Field(FieldIndex),
    Fulltext(FulltextIndex),
}

struct SecondaryIndex {
    id: u64,
    definition: IndexDefinition,
    store: IndexStore,
}

impl SecondaryIndex {
    fn insert(&mut self, doc: &Document) {
        match &mut self.store {
            IndexStore::Field(idx) => idx.insert(doc),
            IndexStore::Fulltext(idx) => idx.insert(doc),
        }
    }

    fn remove(&mut self, doc: &Document) {
        match &mut self.store {
            IndexStore::Field(idx) => idx.remove(doc),
            IndexStore::Fulltext(idx) => idx.remove(doc),
        }
    }

    fn clear(&mut self) {
        match &mut self.store {
            IndexStore::Field(idx) => idx.clear(),
            IndexStore::Fulltext(idx) => idx.clear(),
        }
    }
}

/// Serializable image of a collection, used by journal checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub name: String,
    pub revision: Revision,
    pub tick: Revision,
    pub wait_for_sync: bool,
    pub next_index_id: u64,
    pub indexes: Vec<(u64, IndexDefinition)>,
    /// Documents in insertion order.
    pub documents: Vec<Document>,
}

/// A named set of keyed documents.
///
/// Documents are additionally ordered by revision. Revisions come from a
/// per-collection tick that never goes backwards, so the revision order is
/// the insertion order (a replaced or updated document moves to the end).
/// That order drives `first` and cap eviction.
pub struct Collection {
    name: String,
    documents: HashMap<String, Document>,
    order: BTreeMap<Revision, String>,
    revision: Revision,
    tick: Revision,
    wait_for_sync: bool,
    cap: Option<CapConstraint>,
    indexes: Vec<SecondaryIndex>,
    next_index_id: u64,
}

impl Collection {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            documents: HashMap::new(),
            order: BTreeMap::new(),
            revision: 0,
            tick: 0,
            wait_for_sync: false,
            cap: None,
            indexes: Vec::new(),
            next_index_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn count(&self) -> usize {
        self.documents.len()
    }

    /// Revision of the most recent mutation.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub(crate) fn tick(&self) -> Revision {
        self.tick
    }

    pub fn wait_for_sync(&self) -> bool {
        self.wait_for_sync
    }

    pub fn set_wait_for_sync(&mut self, value: bool) {
        self.wait_for_sync = value;
    }

    pub fn cap_constraint(&self) -> Option<CapConstraint> {
        self.cap
    }

    fn allocate_revision(&mut self) -> Revision {
        self.tick += 1;
        self.tick
    }

    fn unique_violation(&self, field: &str) -> Error {
        Error::UniqueConstraintViolated {
            collection: self.name.clone(),
            field: field.to_string(),
        }
    }

    fn not_found(&self, key: &str) -> Error {
        Error::DocumentNotFound {
            collection: self.name.clone(),
            key: key.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &str) -> Option<&Document> {
        self.documents.get(key)
    }

    pub fn document(&self, key: &str) -> Result<&Document> {
        self.documents.get(key).ok_or_else(|| self.not_found(key))
    }

    /// All documents in insertion order.
    pub fn all(&self) -> impl Iterator<Item = &Document> {
        self.order.values().filter_map(|key| self.documents.get(key))
    }

    /// The `n` oldest documents.
    pub fn first(&self, n: usize) -> Vec<&Document> {
        self.all().take(n).collect()
    }

    pub fn oldest_key(&self) -> Option<String> {
        self.order.values().next().cloned()
    }

    /// Documents matching `filter` in insertion order, plus the number of
    /// documents examined.
    pub fn find(&self, filter: &Filter) -> (Vec<&Document>, usize) {
        let field_indexes: Vec<&FieldIndex> = self
            .indexes
            .iter()
            .filter_map(|idx| match &idx.store {
                IndexStore::Field(f) => Some(f),
                IndexStore::Fulltext(_) => None,
            })
            .collect();

        match filter.candidates(&field_indexes) {
            Some(keys) => {
                let mut docs: Vec<&Document> = keys
                    .iter()
                    .filter_map(|k| self.documents.get(k))
                    .collect();
                let scanned = docs.len();
                docs.retain(|d| filter.matches(d));
                docs.sort_by_key(|d| d.revision);
                (docs, scanned)
            }
            None => {
                let docs = self.all().filter(|d| filter.matches(d)).collect();
                (docs, self.count())
            }
        }
    }

    pub fn by_example(&self, example: &Value) -> Result<Vec<&Document>> {
        let filter = filter::example_filter(example)?;
        Ok(self.find(&filter).0)
    }

    pub fn first_example(&self, example: &Value) -> Result<Option<&Document>> {
        Ok(self.by_example(example)?.into_iter().next())
    }

    /// Documents whose `attribute` matches a fulltext query. Requires a
    /// fulltext index on that attribute.
    pub fn fulltext(&self, attribute: &str, query: &str) -> Result<Vec<&Document>> {
        let idx = self
            .indexes
            .iter()
            .find_map(|idx| match &idx.store {
                IndexStore::Fulltext(f) if f.field == attribute => Some(f),
                _ => None,
            })
            .ok_or_else(|| {
                Error::IndexNotFound(format!("no fulltext index on {}.{}", self.name, attribute))
            })?;
        let mut docs: Vec<&Document> = idx
            .search(query)?
            .iter()
            .filter_map(|k| self.documents.get(k))
            .collect();
        docs.sort_by_key(|d| d.revision);
        Ok(docs)
    }

    // -----------------------------------------------------------------------
    // Mutations
    //
    // Each validates completely before touching state, so a failed call
    // leaves the collection unchanged.
    // -----------------------------------------------------------------------

    fn check_unique(&self, doc: &Document) -> Result<()> {
        for idx in &self.indexes {
            if let IndexStore::Field(f) = &idx.store {
                if f.violates_unique(doc) {
                    return Err(self.unique_violation(&f.fields.join(",")));
                }
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, body: Value) -> Result<Document> {
        let (key, fields) = document::split_body(body)?;
        if let Some(k) = &key {
            if self.documents.contains_key(k) {
                return Err(self.unique_violation("_key"));
            }
        }

        let mut doc = Document::new(key.clone().unwrap_or_default(), 0, fields);
        self.check_unique(&doc)?;

        let mut revision = self.allocate_revision();
        if key.is_none() {
            // generated keys come from the tick
            while self.documents.contains_key(&revision.to_string()) {
                revision = self.allocate_revision();
            }
            doc.key = revision.to_string();
        }
        doc.revision = revision;
        self.revision = revision;
        self.put(doc.clone());
        Ok(doc)
    }

    /// Replace a document's fields entirely. Returns `(prior, new)`.
    pub fn replace(&mut self, key: &str, body: Value) -> Result<(Document, Document)> {
        let prior = self.document(key)?.clone();
        let (_, fields) = document::split_body(body)?;
        let mut next = Document::new(key.to_string(), 0, fields);
        self.check_unique(&next)?;
        next.revision = self.allocate_revision();
        self.revision = next.revision;
        self.put(next.clone());
        Ok((prior, next))
    }

    /// Merge `patch` into a document. Returns `(prior, new)`.
    pub fn update(&mut self, key: &str, patch: Value, keep_null: bool) -> Result<(Document, Document)> {
        let prior = self.document(key)?.clone();
        let (_, patch) = document::split_body(patch)?;
        let mut next = prior.clone();
        document::merge_patch(&mut next.fields, patch, keep_null);
        self.check_unique(&next)?;
        next.revision = self.allocate_revision();
        self.revision = next.revision;
        self.put(next.clone());
        Ok((prior, next))
    }

    pub fn remove(&mut self, key: &str) -> Result<Document> {
        let prior = self.take(key).ok_or_else(|| self.not_found(key))?;
        self.revision = self.allocate_revision();
        Ok(prior)
    }

    /// Remove every document, returning them in insertion order.
    pub fn truncate(&mut self) -> Vec<Document> {
        if self.documents.is_empty() {
            return Vec::new();
        }
        let removed: Vec<Document> = self
            .order
            .values()
            .filter_map(|k| self.documents.get(k).cloned())
            .collect();
        self.documents.clear();
        self.order.clear();
        for idx in &mut self.indexes {
            idx.clear();
        }
        self.revision = self.allocate_revision();
        removed
    }

    // -----------------------------------------------------------------------
    // Raw access: no validation, no revision allocation
    // -----------------------------------------------------------------------

    /// Store `doc` as-is, replacing any document with the same key.
    pub(crate) fn put(&mut self, doc: Document) -> Option<Document> {
        let prior = self.take(&doc.key);
        if doc.revision > self.tick {
            self.tick = doc.revision;
        }
        for idx in &mut self.indexes {
            idx.insert(&doc);
        }
        self.order.insert(doc.revision, doc.key.clone());
        self.documents.insert(doc.key.clone(), doc);
        prior
    }

    pub(crate) fn take(&mut self, key: &str) -> Option<Document> {
        let doc = self.documents.remove(key)?;
        self.order.remove(&doc.revision);
        for idx in &mut self.indexes {
            idx.remove(&doc);
        }
        Some(doc)
    }

    /// Reverse the effect recorded by `entry`.
    pub(crate) fn undo(&mut self, entry: UndoEntry) {
        match entry {
            UndoEntry::Insert { key, .. } => {
                self.take(&key);
            }
            UndoEntry::Remove { prior, .. }
            | UndoEntry::Replace { prior, .. }
            | UndoEntry::Update { prior, .. } => {
                self.put(prior);
            }
            UndoEntry::Truncate { priors: docs, .. } | UndoEntry::CapEvict { evicted: docs, .. } => {
                for doc in docs {
                    self.put(doc);
                }
            }
        }
    }

    pub(crate) fn restore_revision(&mut self, revision: Revision) {
        self.revision = revision;
    }

    /// Used by journal replay to reinstate the counters of a commit.
    pub(crate) fn set_counters(&mut self, revision: Revision, tick: Revision) {
        self.revision = revision;
        self.tick = self.tick.max(tick);
    }

    // -----------------------------------------------------------------------
    // Indexes
    // -----------------------------------------------------------------------

    fn info(&self, id: u64, definition: &IndexDefinition) -> IndexInfo {
        IndexInfo {
            id: format!("{}/{}", self.name, id),
            kind: definition.kind,
            fields: definition.fields.clone(),
            unique: definition.unique,
            size: definition.size,
        }
    }

    fn validate_definition(definition: &IndexDefinition) -> Result<()> {
        match definition.kind {
            IndexKind::Geo | IndexKind::PriorityQueue => {
                Err(Error::UnsupportedIndex(definition.kind.to_string()))
            }
            IndexKind::Cap => match definition.size {
                Some(size) if size > 0 => Ok(()),
                _ => Err(Error::BadParameter("cap constraint size must be at least 1".into())),
            },
            IndexKind::Fulltext if definition.fields.len() != 1 => Err(Error::BadParameter(
                "fulltext index takes exactly one attribute".into(),
            )),
            _ if definition.fields.is_empty() => {
                Err(Error::BadParameter("index needs at least one attribute".into()))
            }
            _ => Ok(()),
        }
    }

    /// Create an index unless an identical one exists. Installing a cap
    /// constraint trims the collection to size immediately.
    pub fn ensure_index(&mut self, definition: &IndexDefinition) -> Result<IndexInfo> {
        Self::validate_definition(definition)?;

        if definition.kind == IndexKind::Cap {
            if let Some(cap) = self.cap {
                if Some(cap.size) == definition.size {
                    return Ok(self.info(cap.index_id, definition));
                }
                return Err(Error::BadParameter(format!(
                    "collection {} already has a cap constraint",
                    self.name
                )));
            }
            let id = self.next_index_id;
            self.install_index(id, definition.clone())?;
            cap::evict_overflow(self);
            return Ok(self.info(id, definition));
        }

        if let Some(existing) = self.indexes.iter().find(|i| i.definition == *definition) {
            return Ok(self.info(existing.id, &existing.definition));
        }
        let id = self.next_index_id;
        self.install_index(id, definition.clone())?;
        Ok(self.info(id, definition))
    }

    fn install_index(&mut self, id: u64, definition: IndexDefinition) -> Result<()> {
        match definition.kind {
            IndexKind::Cap => {
                let size = definition.size.unwrap_or(1);
                self.cap = Some(CapConstraint { index_id: id, size });
            }
            IndexKind::Fulltext => {
                let mut idx = FulltextIndex::new(definition.fields[0].clone());
                for doc in self.documents.values() {
                    idx.insert(doc);
                }
                self.indexes.push(SecondaryIndex {
                    id,
                    definition,
                    store: IndexStore::Fulltext(idx),
                });
            }
            _ => {
                let mut idx = FieldIndex::new(definition.fields.clone(), definition.unique);
                for doc in self.all() {
                    if idx.violates_unique(doc) {
                        return Err(self.unique_violation(&definition.fields.join(",")));
                    }
                    idx.insert(doc);
                }
                self.indexes.push(SecondaryIndex {
                    id,
                    definition,
                    store: IndexStore::Field(idx),
                });
            }
        }
        self.next_index_id = self.next_index_id.max(id + 1);
        Ok(())
    }

    /// Drop an index by id (`"<collection>/<n>"` or `"<n>"`). Returns false
    /// when no such index exists.
    pub fn drop_index(&mut self, id: &str) -> Result<bool> {
        let numeric = id.rsplit('/').next().unwrap_or(id);
        let id: u64 = numeric
            .parse()
            .map_err(|_| Error::IndexNotFound(id.to_string()))?;
        if self.cap.is_some_and(|c| c.index_id == id) {
            self.cap = None;
            return Ok(true);
        }
        let before = self.indexes.len();
        self.indexes.retain(|idx| idx.id != id);
        Ok(self.indexes.len() != before)
    }

    pub fn indexes(&self) -> Vec<IndexInfo> {
        let mut infos: Vec<IndexInfo> = self
            .indexes
            .iter()
            .map(|idx| self.info(idx.id, &idx.definition))
            .collect();
        if let Some(cap) = self.cap {
            infos.push(self.info(cap.index_id, &IndexDefinition::cap(cap.size)));
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> CollectionSnapshot {
        let mut indexes: Vec<(u64, IndexDefinition)> = self
            .indexes
            .iter()
            .map(|idx| (idx.id, idx.definition.clone()))
            .collect();
        if let Some(cap) = self.cap {
            indexes.push((cap.index_id, IndexDefinition::cap(cap.size)));
        }
        CollectionSnapshot {
            name: self.name.clone(),
            revision: self.revision,
            tick: self.tick,
            wait_for_sync: self.wait_for_sync,
            next_index_id: self.next_index_id,
            indexes,
            documents: self.all().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: CollectionSnapshot) -> Result<Self> {
        let mut coll = Collection::new(&snapshot.name);
        coll.wait_for_sync = snapshot.wait_for_sync;
        for doc in snapshot.documents {
            coll.put(doc);
        }
        for (id, definition) in snapshot.indexes {
            Self::validate_definition(&definition)?;
            coll.install_index(id, definition)?;
        }
        coll.next_index_id = coll.next_index_id.max(snapshot.next_index_id);
        coll.set_counters(snapshot.revision, snapshot.tick);
        Ok(coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(c: &Collection) -> Vec<String> {
        c.all().map(|d| d.key.clone()).collect()
    }

    #[test]
    fn insert_generates_keys_and_revisions() {
        let mut c = Collection::new("users");
        let a = c.insert(json!({"name": "a"})).unwrap();
        let b = c.insert(json!({"_key": "bob", "name": "b"})).unwrap();
        assert!(!a.key.is_empty());
        assert!(b.revision > a.revision);
        assert_eq!(c.revision(), b.revision);
        assert_eq!(c.count(), 2);
    }

    #[test]
    fn duplicate_key_is_unique_violation() {
        let mut c = Collection::new("users");
        c.insert(json!({"_key": "foo"})).unwrap();
        let err = c.insert(json!({"_key": "foo"})).unwrap_err();
        assert_eq!(err.code(), 1210);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn replace_and_update_bump_revision() {
        let mut c = Collection::new("c");
        let doc = c.insert(json!({"_key": "k", "a": 1, "b": 2})).unwrap();
        let (prior, replaced) = c.replace("k", json!({"a": 5})).unwrap();
        assert_eq!(prior.revision, doc.revision);
        assert!(replaced.revision > doc.revision);
        assert_eq!(replaced.get_field("b"), None);

        let (_, updated) = c.update("k", json!({"b": 3}), false).unwrap();
        assert_eq!(updated.get_field("a"), Some(json!(5)));
        assert_eq!(updated.get_field("b"), Some(json!(3)));
        assert!(updated.revision > replaced.revision);
    }

    #[test]
    fn missing_document_errors() {
        let mut c = Collection::new("c");
        assert_eq!(c.remove("nope").unwrap_err().code(), 1202);
        assert_eq!(c.replace("nope", json!({})).unwrap_err().code(), 1202);
        assert_eq!(c.document("nope").unwrap_err().code(), 1202);
    }

    #[test]
    fn first_follows_insertion_order() {
        let mut c = Collection::new("c");
        for k in ["x", "a", "m"] {
            c.insert(json!({ "_key": k })).unwrap();
        }
        let first: Vec<&str> = c.first(2).iter().map(|d| d.key.as_str()).collect();
        assert_eq!(first, ["x", "a"]);
        c.update("x", json!({"v": 1}), false).unwrap();
        assert_eq!(keys(&c), ["a", "m", "x"]);
    }

    #[test]
    fn undo_restores_exact_documents() {
        let mut c = Collection::new("c");
        let foo = c.insert(json!({"_key": "foo", "v": 1})).unwrap();
        let bar = c.insert(json!({"_key": "bar"})).unwrap();
        let before = c.revision();

        let (prior, _) = c.update("foo", json!({"v": 2}), false).unwrap();
        let removed = c.remove("bar").unwrap();
        c.undo(UndoEntry::Remove { collection: "c".into(), prior: removed });
        c.undo(UndoEntry::Update { collection: "c".into(), prior });
        c.restore_revision(before);

        assert_eq!(c.document("foo").unwrap(), &foo);
        assert_eq!(c.document("bar").unwrap(), &bar);
        assert_eq!(keys(&c), ["foo", "bar"]);
        assert_eq!(c.revision(), before);
    }

    #[test]
    fn unique_index_blocks_duplicates() {
        let mut c = Collection::new("c");
        c.ensure_index(&IndexDefinition::unique_hash(&["email"])).unwrap();
        c.insert(json!({"_key": "a", "email": "x"})).unwrap();
        let err = c.insert(json!({"_key": "b", "email": "x"})).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
        assert!(c.get("b").is_none());
        // updating a document to its own value is fine
        c.update("a", json!({"email": "x", "n": 1}), false).unwrap();
    }

    #[test]
    fn unique_index_build_fails_on_existing_duplicates() {
        let mut c = Collection::new("c");
        c.insert(json!({"v": 1})).unwrap();
        c.insert(json!({"v": 1})).unwrap();
        assert!(c.ensure_index(&IndexDefinition::unique_skiplist(&["v"])).is_err());
        assert!(c.indexes().is_empty());
    }

    #[test]
    fn ensure_index_is_idempotent() {
        let mut c = Collection::new("c");
        let a = c.ensure_index(&IndexDefinition::hash(&["v"])).unwrap();
        let b = c.ensure_index(&IndexDefinition::hash(&["v"])).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(c.indexes().len(), 1);
        assert!(c.drop_index(&a.id).unwrap());
        assert!(!c.drop_index(&a.id).unwrap());
    }

    #[test]
    fn unsupported_index_kinds() {
        let mut c = Collection::new("c");
        let err = c.ensure_index(&IndexDefinition::geo(&["lat", "lon"])).unwrap_err();
        assert!(matches!(err, Error::UnsupportedIndex(_)));
        let err = c.ensure_index(&IndexDefinition::priority_queue("p")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedIndex(_)));
    }

    #[test]
    fn fulltext_requires_index() {
        let mut c = Collection::new("c");
        c.insert(json!({"text": "steam engine"})).unwrap();
        assert!(matches!(c.fulltext("text", "steam"), Err(Error::IndexNotFound(_))));
        c.ensure_index(&IndexDefinition::fulltext("text")).unwrap();
        assert_eq!(c.fulltext("text", "prefix:ste").unwrap().len(), 1);
    }

    #[test]
    fn truncate_clears_indexes() {
        let mut c = Collection::new("c");
        c.ensure_index(&IndexDefinition::unique_hash(&["v"])).unwrap();
        c.insert(json!({"v": 1})).unwrap();
        let removed = c.truncate();
        assert_eq!(removed.len(), 1);
        assert_eq!(c.count(), 0);
        c.insert(json!({"v": 1})).unwrap();
    }

    #[test]
    fn snapshot_round_trip_preserves_order_and_counters() {
        let mut c = Collection::new("c");
        c.ensure_index(&IndexDefinition::cap(3)).unwrap();
        c.ensure_index(&IndexDefinition::skiplist(&["n"])).unwrap();
        for i in 0..3 {
            c.insert(json!({ "_key": format!("k{i}"), "n": i })).unwrap();
        }
        c.update("k0", json!({"n": 10}), false).unwrap();
        let restored = Collection::from_snapshot(c.snapshot()).unwrap();
        assert_eq!(keys(&restored), keys(&c));
        assert_eq!(restored.revision(), c.revision());
        assert_eq!(restored.tick(), c.tick());
        assert_eq!(restored.indexes(), c.indexes());
        let (found, _) = restored.find(&filter::parse_filter(&json!({"n": {"$gte": 2}})).unwrap());
        assert_eq!(found.len(), 2);
    }
}
