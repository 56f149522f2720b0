use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;

use crate::document::Document;
use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::transaction::Transaction;
use crate::value::IndexValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// What a query does with each matching document.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAction {
    /// `RETURN d`
    Return,
    /// `REMOVE d._key IN target`
    Remove { target: String },
    /// `UPDATE d._key WITH patch IN target`
    Update {
        target: String,
        patch: Value,
        keep_null: bool,
    },
}

/// `FOR d IN collection FILTER .. SORT .. LIMIT offset, count` followed by
/// a [`QueryAction`].
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filter: Option<Value>,
    pub sort: Vec<(String, SortOrder)>,
    pub offset: usize,
    pub limit: Option<usize>,
    pub action: QueryAction,
    /// Count writes against missing documents as ignored instead of failing.
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub writes_executed: usize,
    pub writes_ignored: usize,
    pub scanned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// Returned documents; for modifying queries, the old (remove) or new
    /// (update) versions of the written documents.
    pub documents: Vec<Value>,
    pub stats: QueryStats,
}

impl Query {
    pub fn for_in(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            sort: Vec::new(),
            offset: 0,
            limit: None,
            action: QueryAction::Return,
            ignore_errors: false,
        }
    }

    pub fn filter(mut self, filter: Value) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn limit(mut self, offset: usize, count: usize) -> Self {
        self.offset = offset;
        self.limit = Some(count);
        self
    }

    pub fn remove_in(mut self, target: impl Into<String>) -> Self {
        self.action = QueryAction::Remove {
            target: target.into(),
        };
        self
    }

    pub fn update_in(mut self, target: impl Into<String>, patch: Value) -> Self {
        self.action = QueryAction::Update {
            target: target.into(),
            patch,
            keep_null: false,
        };
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    /// The collection the query writes to, if any.
    pub fn target(&self) -> Option<&str> {
        match &self.action {
            QueryAction::Return => None,
            QueryAction::Remove { target } | QueryAction::Update { target, .. } => Some(target),
        }
    }

    /// Collections to declare for an implicit transaction running this query.
    pub fn collections(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let mut read = BTreeSet::new();
        let mut write = BTreeSet::new();
        match self.target() {
            Some(target) => {
                write.insert(target.to_string());
                if target != self.collection {
                    read.insert(self.collection.clone());
                }
            }
            None => {
                read.insert(self.collection.clone());
            }
        }
        (read, write)
    }

    /// Parse the JSON form:
    ///
    /// ```json
    /// {"for": "c", "filter": {"a": {"$gt": 1}}, "sort": {"a": -1},
    ///  "offset": 0, "limit": 10, "remove": "c"}
    /// ```
    ///
    /// `"update": {"in": "c", "with": {...}, "keepNull": false}` replaces
    /// `"remove"` for updates. Without either the documents are returned.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;
        let collection = obj
            .get("for")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidQuery("query needs a \"for\" collection".into()))?;
        let mut query = Query::for_in(collection);

        if let Some(filter) = obj.get("filter") {
            query.filter = Some(filter.clone());
        }
        if let Some(sort) = obj.get("sort") {
            let fields = sort
                .as_object()
                .ok_or_else(|| Error::InvalidQuery("sort must be an object".into()))?;
            for (field, dir) in fields {
                let order = match dir.as_i64() {
                    Some(1) => SortOrder::Asc,
                    Some(-1) => SortOrder::Desc,
                    _ => {
                        return Err(Error::InvalidQuery(
                            "sort direction must be 1 (asc) or -1 (desc)".into(),
                        ));
                    }
                };
                query.sort.push((field.clone(), order));
            }
        }
        query.offset = optional_count(obj.get("offset"), "offset")?.unwrap_or(0);
        query.limit = optional_count(obj.get("limit"), "limit")?;
        if let Some(ignore) = obj.get("ignoreErrors") {
            query.ignore_errors = ignore
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("ignoreErrors must be a boolean".into()))?;
        }

        match (obj.get("remove"), obj.get("update")) {
            (Some(_), Some(_)) => {
                return Err(Error::InvalidQuery("a query either removes or updates".into()));
            }
            (Some(target), None) => {
                let target = target
                    .as_str()
                    .ok_or_else(|| Error::InvalidQuery("remove target must be a name".into()))?;
                query.action = QueryAction::Remove {
                    target: target.to_string(),
                };
            }
            (None, Some(update)) => {
                let target = update
                    .get("in")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::InvalidQuery("update needs an \"in\" target".into()))?;
                let patch = update
                    .get("with")
                    .filter(|p| p.is_object())
                    .ok_or_else(|| Error::InvalidQuery("update needs a \"with\" object".into()))?;
                let keep_null = update.get("keepNull").and_then(Value::as_bool).unwrap_or(false);
                query.action = QueryAction::Update {
                    target: target.to_string(),
                    patch: patch.clone(),
                    keep_null,
                };
            }
            (None, None) => {}
        }
        Ok(query)
    }
}

fn optional_count(value: Option<&Value>, what: &str) -> Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| Error::InvalidQuery(format!("{what} must be a non-negative integer"))),
    }
}

fn compare(a: &Document, b: &Document, sort: &[(String, SortOrder)]) -> Ordering {
    for (field, order) in sort {
        let va = a.get_field(field).map_or(IndexValue::Null, |v| IndexValue::from_json(&v));
        let vb = b.get_field(field).map_or(IndexValue::Null, |v| IndexValue::from_json(&v));
        let ord = match order {
            SortOrder::Asc => va.cmp(&vb),
            SortOrder::Desc => vb.cmp(&va),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Run `query` inside `tx`. Reads and writes go through the transaction, so
/// the lock set and undo log apply as for any other operation.
pub(crate) fn execute(tx: &mut Transaction<'_>, query: &Query) -> Result<QueryResult> {
    let filter = match &query.filter {
        Some(raw) => filter::parse_filter(raw)?,
        None => Filter::All,
    };

    let (mut docs, scanned) = tx.scan(&query.collection, &filter)?;
    if !query.sort.is_empty() {
        docs.sort_by(|a, b| compare(a, b, &query.sort));
    }
    let docs: Vec<Document> = docs
        .into_iter()
        .skip(query.offset)
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();

    let mut stats = QueryStats {
        scanned,
        ..QueryStats::default()
    };
    let mut documents = Vec::with_capacity(docs.len());

    match &query.action {
        QueryAction::Return => {
            documents.extend(docs.iter().map(|d| d.to_value(&query.collection)));
        }
        QueryAction::Remove { target } => {
            for doc in &docs {
                match tx.remove(target, &doc.key) {
                    Ok(_) => {
                        stats.writes_executed += 1;
                        documents.push(doc.to_value(target));
                    }
                    Err(Error::DocumentNotFound { .. }) if query.ignore_errors => {
                        stats.writes_ignored += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        QueryAction::Update {
            target,
            patch,
            keep_null,
        } => {
            for doc in &docs {
                match tx.update_with(target, &doc.key, patch.clone(), *keep_null) {
                    Ok(_) => {
                        stats.writes_executed += 1;
                        documents.push(tx.document(target, &doc.key)?);
                    }
                    Err(Error::DocumentNotFound { .. }) if query.ignore_errors => {
                        stats.writes_ignored += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(QueryResult { documents, stats })
}
