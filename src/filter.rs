use std::collections::BTreeSet;
use std::ops::Bound;

use serde_json::{Map, Value};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::index::FieldIndex;
use crate::value::IndexValue;

// ---------------------------------------------------------------------------
// Filter AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Condition {
    Eq(IndexValue),
    Ne(IndexValue),
    Gt(IndexValue),
    Gte(IndexValue),
    Lt(IndexValue),
    Lte(IndexValue),
    In(Vec<IndexValue>),
    Exists(bool),
}

#[derive(Debug, Clone)]
pub enum Filter {
    Field { field: String, cond: Condition },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    All,
}

impl Filter {
    fn and(mut conditions: Vec<Filter>) -> Filter {
        match conditions.len() {
            0 => Filter::All,
            1 => conditions.remove(0),
            _ => Filter::And(conditions),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Field { field, cond } => {
                let value = doc.get_field(field);
                if let Condition::Exists(expected) = cond {
                    return value.is_some() == *expected;
                }
                let Some(value) = value else {
                    return false;
                };
                let iv = IndexValue::from_json(&value);
                match cond {
                    Condition::Eq(v) => iv == *v,
                    Condition::Ne(v) => iv != *v,
                    Condition::Gt(v) => iv > *v,
                    Condition::Gte(v) => iv >= *v,
                    Condition::Lt(v) => iv < *v,
                    Condition::Lte(v) => iv <= *v,
                    Condition::In(vals) => vals.contains(&iv),
                    Condition::Exists(_) => false,
                }
            }
            Filter::And(subs) => subs.iter().all(|s| s.matches(doc)),
            Filter::Or(subs) => subs.iter().any(|s| s.matches(doc)),
        }
    }

    /// Resolve the filter to candidate keys using single-field indexes.
    /// `None` means a full scan is needed. Candidates still need `matches`.
    pub fn candidates(&self, indexes: &[&FieldIndex]) -> Option<BTreeSet<String>> {
        match self {
            Filter::All => None,
            Filter::Field { field, cond } => {
                let idx = indexes.iter().find(|idx| idx.covers(field))?;
                Some(match cond {
                    Condition::Eq(v) => idx.find_eq(v),
                    Condition::Gt(v) => idx.find_range(Bound::Excluded(v), Bound::Unbounded),
                    Condition::Gte(v) => idx.find_range(Bound::Included(v), Bound::Unbounded),
                    Condition::Lt(v) => idx.find_range(Bound::Unbounded, Bound::Excluded(v)),
                    Condition::Lte(v) => idx.find_range(Bound::Unbounded, Bound::Included(v)),
                    Condition::In(vals) => idx.find_in(vals),
                    Condition::Ne(_) | Condition::Exists(_) => return None,
                })
            }
            Filter::And(subs) => {
                let mut result: Option<BTreeSet<String>> = None;
                for sub in subs {
                    if let Some(keys) = sub.candidates(indexes) {
                        result = Some(match result {
                            Some(existing) => &existing & &keys,
                            None => keys,
                        });
                    }
                }
                result
            }
            Filter::Or(subs) => {
                let mut result = BTreeSet::new();
                for sub in subs {
                    result = &result | &sub.candidates(indexes)?;
                }
                Some(result)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing: JSON -> Filter
// ---------------------------------------------------------------------------

/// Parse an operator filter such as `{"age": {"$gte": 18}, "$or": [...]}`.
pub fn parse_filter(filter: &Value) -> Result<Filter> {
    let obj = filter
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("filter must be a JSON object".into()))?;

    let mut conditions = Vec::new();
    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_filter).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Filter::And(subs)
                } else {
                    Filter::Or(subs)
                });
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op_key, op_val) in ops {
                        conditions.push(Filter::Field {
                            field: field.to_string(),
                            cond: parse_condition(op_key, op_val)?,
                        });
                    }
                }
                _ => conditions.push(Filter::Field {
                    field: field.to_string(),
                    cond: Condition::Eq(IndexValue::from_json(value)),
                }),
            },
        }
    }
    Ok(Filter::and(conditions))
}

fn parse_condition(op_key: &str, op_val: &Value) -> Result<Condition> {
    let v = || IndexValue::from_json(op_val);
    match op_key {
        "$eq" => Ok(Condition::Eq(v())),
        "$ne" => Ok(Condition::Ne(v())),
        "$gt" => Ok(Condition::Gt(v())),
        "$gte" => Ok(Condition::Gte(v())),
        "$lt" => Ok(Condition::Lt(v())),
        "$lte" => Ok(Condition::Lte(v())),
        "$in" => {
            let arr = op_val
                .as_array()
                .ok_or_else(|| Error::InvalidQuery("$in must be an array".into()))?;
            Ok(Condition::In(arr.iter().map(IndexValue::from_json).collect()))
        }
        "$exists" => op_val
            .as_bool()
            .map(Condition::Exists)
            .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into())),
        _ => Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    }
}

/// Build an equality filter from an example document. Nested objects are
/// matched attribute by attribute, so `{"a": {"b": 1}}` means `a.b == 1`.
pub fn example_filter(example: &Value) -> Result<Filter> {
    let obj = example
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("example must be a JSON object".into()))?;
    let mut conditions = Vec::new();
    flatten_example(obj, "", &mut conditions);
    Ok(Filter::and(conditions))
}

fn flatten_example(obj: &Map<String, Value>, prefix: &str, out: &mut Vec<Filter>) {
    for (key, value) in obj {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(sub) if !sub.is_empty() => flatten_example(sub, &path, out),
            _ => out.push(Filter::Field {
                field: path,
                cond: Condition::Eq(IndexValue::from_json(value)),
            }),
        }
    }
}
