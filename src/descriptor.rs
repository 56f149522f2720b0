use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// A transaction body. Receives the transaction handle and the descriptor's
/// params; returning `Err` aborts the transaction.
pub type Action<'a> = Box<dyn FnOnce(&mut Transaction<'_>, Option<&Value>) -> Result<Value> + 'a>;

/// A reusable action stored in an [`ActionRegistry`].
pub type RegisteredAction =
    Arc<dyn Fn(&mut Transaction<'_>, Option<&Value>) -> Result<Value> + Send + Sync>;

/// Everything needed to run one transaction.
pub struct TransactionDescriptor<'a> {
    pub read: BTreeSet<String>,
    pub write: BTreeSet<String>,
    pub params: Option<Value>,
    /// Seconds to wait for collection locks. `None` uses the configured default.
    pub lock_timeout: Option<f64>,
    pub wait_for_sync: Option<bool>,
    /// Whether undeclared collections may be read. `None` uses the configured default.
    pub allow_implicit: Option<bool>,
    pub(crate) action: Action<'a>,
}

impl fmt::Debug for TransactionDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionDescriptor")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("params", &self.params)
            .field("lock_timeout", &self.lock_timeout)
            .field("wait_for_sync", &self.wait_for_sync)
            .field("allow_implicit", &self.allow_implicit)
            .finish_non_exhaustive()
    }
}

impl<'a> TransactionDescriptor<'a> {
    pub fn new(
        action: impl FnOnce(&mut Transaction<'_>, Option<&Value>) -> Result<Value> + 'a,
    ) -> Self {
        Self {
            read: BTreeSet::new(),
            write: BTreeSet::new(),
            params: None,
            lock_timeout: None,
            wait_for_sync: None,
            allow_implicit: None,
            action: Box::new(action),
        }
    }

    pub fn read(mut self, collection: impl Into<String>) -> Self {
        self.read.insert(collection.into());
        self
    }

    pub fn write(mut self, collection: impl Into<String>) -> Self {
        self.write.insert(collection.into());
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn lock_timeout(mut self, seconds: f64) -> Self {
        self.lock_timeout = Some(seconds);
        self
    }

    pub fn wait_for_sync(mut self, wait: bool) -> Self {
        self.wait_for_sync = Some(wait);
        self
    }

    pub fn allow_implicit(mut self, allow: bool) -> Self {
        self.allow_implicit = Some(allow);
        self
    }

    /// Shape checks that do not need the catalog.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.lock_timeout {
            if !t.is_finite() || t < 0.0 {
                return Err(Error::BadParameter(format!(
                    "lockTimeout must be a non-negative number, got {t}"
                )));
            }
        }
        for name in self.read.iter().chain(&self.write) {
            if name.is_empty() {
                return Err(Error::BadParameter("empty collection name".into()));
            }
        }
        Ok(())
    }

    /// Build a descriptor from its JSON form:
    ///
    /// ```json
    /// {"collections": {"read": "a", "write": ["b"]}, "action": "<source>",
    ///  "params": [1, 2], "lockTimeout": 5, "waitForSync": true}
    /// ```
    ///
    /// The action source text is resolved through `registry`.
    pub fn from_json(raw: &Value, registry: &ActionRegistry) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| Error::BadParameter("transaction descriptor must be an object".into()))?;

        let collections = obj
            .get("collections")
            .ok_or_else(|| Error::BadParameter("missing collections".into()))?
            .as_object()
            .ok_or_else(|| Error::BadParameter("collections must be an object".into()))?;
        let read = name_set(collections.get("read"), "read")?;
        let write = name_set(collections.get("write"), "write")?;

        let source = match obj.get("action") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(Error::BadParameter("action must be a function".into())),
            None => return Err(Error::BadParameter("missing action".into())),
        };
        let action = registry
            .get(source)
            .ok_or_else(|| Error::BadParameter(format!("action is not a function: {source:?}")))?;

        let lock_timeout = match obj.get("lockTimeout") {
            None => None,
            Some(v) => Some(v.as_f64().ok_or_else(|| {
                Error::BadParameter(format!("lockTimeout must be a number, got {v}"))
            })?),
        };
        let wait_for_sync = optional_bool(obj.get("waitForSync"), "waitForSync")?;
        let allow_implicit = optional_bool(obj.get("allowImplicit"), "allowImplicit")?;

        let descriptor = Self {
            read,
            write,
            params: obj.get("params").cloned(),
            lock_timeout,
            wait_for_sync,
            allow_implicit,
            action: Box::new(move |tx: &mut Transaction<'_>, params: Option<&Value>| {
                action(tx, params)
            }),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn name_set(value: Option<&Value>, what: &str) -> Result<BTreeSet<String>> {
    match value {
        None => Ok(BTreeSet::new()),
        Some(Value::String(name)) => Ok(BTreeSet::from([name.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    Error::BadParameter(format!("collections.{what} must contain names, got {item}"))
                })
            })
            .collect(),
        Some(other) => Err(Error::BadParameter(format!(
            "collections.{what} must be a name or a list of names, got {other}"
        ))),
    }
}

fn optional_bool(value: Option<&Value>, what: &str) -> Result<Option<bool>> {
    match value {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(Error::BadParameter(format!("{what} must be a boolean, got {other}"))),
    }
}

/// Maps action source text to callables for [`TransactionDescriptor::from_json`].
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, RegisteredAction>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        source: impl Into<String>,
        action: impl Fn(&mut Transaction<'_>, Option<&Value>) -> Result<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.actions
            .insert(source.into().trim().to_string(), Arc::new(action));
        self
    }

    pub fn get(&self, source: &str) -> Option<RegisteredAction> {
        self.actions.get(source.trim()).cloned()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
