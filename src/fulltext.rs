use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use serde_json::Value;

use crate::document::Document;
use crate::error::{Error, Result};

/// Words shorter than this are not indexed.
const MIN_WORD_LENGTH: usize = 2;

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= MIN_WORD_LENGTH)
        .map(str::to_lowercase)
}

/// Collect the words of a string attribute, or of every string in an array attribute.
fn words_of(value: &Value) -> BTreeSet<String> {
    match value {
        Value::String(s) => tokenize(s).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .flat_map(tokenize)
            .collect(),
        _ => BTreeSet::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    Complete(String),
    Prefix(String),
}

/// Parse a query such as `"steam,prefix:loco"`. Every term must match.
fn parse_terms(query: &str) -> Result<Vec<Term>> {
    let mut terms = Vec::new();
    for raw in query.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let term = if let Some(word) = raw.strip_prefix("prefix:") {
            Term::Prefix(word.trim().to_lowercase())
        } else if let Some(word) = raw.strip_prefix("complete:") {
            Term::Complete(word.trim().to_lowercase())
        } else {
            Term::Complete(raw.to_lowercase())
        };
        terms.push(term);
    }
    if terms.is_empty() {
        return Err(Error::InvalidQuery(format!("empty fulltext query: {query:?}")));
    }
    Ok(terms)
}

/// In-memory word index over a single document attribute.
#[derive(Debug)]
pub struct FulltextIndex {
    pub field: String,
    words: BTreeMap<String, BTreeSet<String>>,
    by_doc: HashMap<String, BTreeSet<String>>,
}

impl FulltextIndex {
    pub fn new(field: String) -> Self {
        Self {
            field,
            words: BTreeMap::new(),
            by_doc: HashMap::new(),
        }
    }

    pub fn insert(&mut self, doc: &Document) {
        let Some(value) = doc.get_field(&self.field) else {
            return;
        };
        let words = words_of(&value);
        if words.is_empty() {
            return;
        }
        for word in &words {
            self.words
                .entry(word.clone())
                .or_default()
                .insert(doc.key.clone());
        }
        self.by_doc.insert(doc.key.clone(), words);
    }

    pub fn remove(&mut self, doc: &Document) {
        let Some(words) = self.by_doc.remove(&doc.key) else {
            return;
        };
        for word in words {
            if let Some(keys) = self.words.get_mut(&word) {
                keys.remove(&doc.key);
                if keys.is_empty() {
                    self.words.remove(&word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.by_doc.clear();
    }

    fn lookup(&self, term: &Term) -> BTreeSet<String> {
        match term {
            Term::Complete(word) => self.words.get(word).cloned().unwrap_or_default(),
            Term::Prefix(prefix) => {
                let mut keys = BTreeSet::new();
                let range = self
                    .words
                    .range::<String, _>((Bound::Included(prefix), Bound::Unbounded));
                for (word, hits) in range {
                    if !word.starts_with(prefix.as_str()) {
                        break;
                    }
                    keys.extend(hits.iter().cloned());
                }
                keys
            }
        }
    }

    /// Keys of the documents matching every term of `query`.
    pub fn search(&self, query: &str) -> Result<BTreeSet<String>> {
        let mut result: Option<BTreeSet<String>> = None;
        for term in parse_terms(query)? {
            let hits = self.lookup(&term);
            result = Some(match result {
                Some(existing) => &existing & &hits,
                None => hits,
            });
        }
        Ok(result.unwrap_or_default())
    }
}
