use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cap;
use crate::collection::Collection;
use crate::context::ExecutionContext;
use crate::descriptor::TransactionDescriptor;
use crate::document::{Document, DocumentMeta, Revision};
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::index::IndexDefinition;
use crate::journal::{CollectionChanges, JournalRecord};
use crate::lock::LockSet;
use crate::query::{self, Query, QueryResult};
use crate::tx_log::{self, TransactionId, TRANSACTION_LOG};
use crate::undo::{UndoEntry, UndoLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Running,
    Committed,
    Aborted,
}

/// Handle given to a transaction action. Every read and write goes through
/// it so that lock-set checks and undo logging cannot be bypassed.
pub struct Transaction<'a> {
    id: TransactionId,
    ctx: &'a ExecutionContext<'a>,
    locks: LockSet,
    declared_read: BTreeSet<String>,
    lock_timeout: Duration,
    allow_implicit: bool,
    handles: HashMap<String, Arc<RwLock<Collection>>>,
    undo: UndoLog,
    touched: BTreeMap<String, BTreeSet<String>>,
    base_revisions: BTreeMap<String, Revision>,
    writes: usize,
    status: TxStatus,
}

impl<'a> Transaction<'a> {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// The execution context running this transaction.
    pub fn context(&self) -> &'a ExecutionContext<'a> {
        self.ctx
    }

    fn handle(&mut self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(Arc::clone(handle));
        }
        let handle = self.ctx.vault().collection_handle(name)?;
        self.handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn writable(&mut self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        if !self.locks.can_write(name) {
            return Err(Error::UnregisteredCollection(name.to_string()));
        }
        let handle = self.handle(name)?;
        if !self.base_revisions.contains_key(name) {
            let revision = handle.read().revision();
            self.base_revisions.insert(name.to_string(), revision);
        }
        Ok(handle)
    }

    fn readable(&mut self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        if !self.locks.can_read(name) {
            if !self.allow_implicit {
                return Err(Error::UnregisteredCollection(name.to_string()));
            }
            // a missing collection reports as such, not as a lock timeout
            self.ctx.vault().collection_handle(name)?;
            self.locks.add_shared(name, self.lock_timeout)?;
            // resolved again under the lock: it may have been dropped meanwhile
            return self.handle(name);
        }
        self.handle(name)
    }

    fn record(&mut self, entry: UndoEntry) {
        let keys = self.touched.entry(entry.collection().to_string()).or_default();
        match &entry {
            UndoEntry::Insert { key, .. } => {
                keys.insert(key.clone());
            }
            UndoEntry::Remove { prior, .. }
            | UndoEntry::Replace { prior, .. }
            | UndoEntry::Update { prior, .. } => {
                keys.insert(prior.key.clone());
            }
            UndoEntry::Truncate { priors: docs, .. } | UndoEntry::CapEvict { evicted: docs, .. } => {
                keys.extend(docs.iter().map(|d| d.key.clone()));
            }
        }
        if !matches!(entry, UndoEntry::CapEvict { .. }) {
            self.writes += 1;
        }
        self.undo.push(entry);
    }

    /// Insert into `coll` and run the cap evictor, logging both steps.
    fn insert_into(&mut self, handle: &RwLock<Collection>, name: &str, body: Value) -> Result<Document> {
        let mut coll = handle.write();
        let doc = coll.insert(body)?;
        self.record(UndoEntry::Insert {
            collection: name.to_string(),
            key: doc.key.clone(),
        });
        let evicted = cap::evict_overflow(&mut coll);
        if !evicted.is_empty() {
            self.record(UndoEntry::CapEvict {
                collection: name.to_string(),
                evicted,
            });
        }
        Ok(doc)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn insert(&mut self, collection: &str, body: Value) -> Result<DocumentMeta> {
        let handle = self.writable(collection)?;
        let doc = self.insert_into(&handle, collection, body)?;
        Ok(doc.meta(collection, None))
    }

    pub fn replace(&mut self, collection: &str, key: &str, body: Value) -> Result<DocumentMeta> {
        let handle = self.writable(collection)?;
        let (prior, next) = handle.write().replace(key, body)?;
        let old = prior.revision;
        self.record(UndoEntry::Replace {
            collection: collection.to_string(),
            prior,
        });
        Ok(next.meta(collection, Some(old)))
    }

    /// Merge `patch` into a document; `null` attributes are removed.
    pub fn update(&mut self, collection: &str, key: &str, patch: Value) -> Result<DocumentMeta> {
        self.update_with(collection, key, patch, false)
    }

    pub fn update_with(
        &mut self,
        collection: &str,
        key: &str,
        patch: Value,
        keep_null: bool,
    ) -> Result<DocumentMeta> {
        let handle = self.writable(collection)?;
        let (prior, next) = handle.write().update(key, patch, keep_null)?;
        let old = prior.revision;
        self.record(UndoEntry::Update {
            collection: collection.to_string(),
            prior,
        });
        Ok(next.meta(collection, Some(old)))
    }

    pub fn remove(&mut self, collection: &str, key: &str) -> Result<DocumentMeta> {
        let handle = self.writable(collection)?;
        let prior = handle.write().remove(key)?;
        let meta = prior.meta(collection, None);
        self.record(UndoEntry::Remove {
            collection: collection.to_string(),
            prior,
        });
        Ok(meta)
    }

    /// Remove every document; returns how many were removed.
    pub fn truncate(&mut self, collection: &str) -> Result<usize> {
        let handle = self.writable(collection)?;
        let priors = handle.write().truncate();
        let removed = priors.len();
        if removed > 0 {
            self.record(UndoEntry::Truncate {
                collection: collection.to_string(),
                priors,
            });
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn document(&mut self, collection: &str, key: &str) -> Result<Value> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll.document(key)?.to_value(collection))
    }

    pub fn exists(&mut self, collection: &str, key: &str) -> Result<bool> {
        let handle = self.readable(collection)?;
        let exists = handle.read().get(key).is_some();
        Ok(exists)
    }

    pub fn count(&mut self, collection: &str) -> Result<usize> {
        let handle = self.readable(collection)?;
        let count = handle.read().count();
        Ok(count)
    }

    pub fn revision(&mut self, collection: &str) -> Result<Revision> {
        let handle = self.readable(collection)?;
        let revision = handle.read().revision();
        Ok(revision)
    }

    /// All documents in insertion order.
    pub fn all(&mut self, collection: &str) -> Result<Vec<Value>> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll.all().map(|d| d.to_value(collection)).collect())
    }

    /// The `n` oldest documents.
    pub fn first(&mut self, collection: &str, n: usize) -> Result<Vec<Value>> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll.first(n).into_iter().map(|d| d.to_value(collection)).collect())
    }

    pub fn by_example(&mut self, collection: &str, example: &Value) -> Result<Vec<Value>> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll
            .by_example(example)?
            .into_iter()
            .map(|d| d.to_value(collection))
            .collect())
    }

    pub fn first_example(&mut self, collection: &str, example: &Value) -> Result<Option<Value>> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll.first_example(example)?.map(|d| d.to_value(collection)))
    }

    pub fn fulltext(&mut self, collection: &str, attribute: &str, query: &str) -> Result<Vec<Value>> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        Ok(coll
            .fulltext(attribute, query)?
            .into_iter()
            .map(|d| d.to_value(collection))
            .collect())
    }

    /// Run an embedded query against this transaction's lock set.
    pub fn query(&mut self, query: &Query) -> Result<QueryResult> {
        query::execute(self, query)
    }

    /// Matching documents in insertion order, plus the number examined.
    pub(crate) fn scan(&mut self, collection: &str, filter: &Filter) -> Result<(Vec<Document>, usize)> {
        let handle = self.readable(collection)?;
        let coll = handle.read();
        let (docs, scanned) = coll.find(filter);
        Ok((docs.into_iter().cloned().collect(), scanned))
    }

    // -----------------------------------------------------------------------
    // Schema operations are never allowed inside a transaction
    // -----------------------------------------------------------------------

    pub fn create_collection(&mut self, name: &str) -> Result<()> {
        Err(Error::DisallowedOperation(format!("create collection {name}")))
    }

    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        Err(Error::DisallowedOperation(format!("drop collection {name}")))
    }

    pub fn rename_collection(&mut self, from: &str, to: &str) -> Result<()> {
        Err(Error::DisallowedOperation(format!("rename collection {from} to {to}")))
    }

    pub fn ensure_index(&mut self, collection: &str, definition: &IndexDefinition) -> Result<()> {
        Err(Error::DisallowedOperation(format!(
            "ensure {} index on {collection}",
            definition.kind
        )))
    }

    pub fn drop_index(&mut self, collection: &str, id: &str) -> Result<()> {
        Err(Error::DisallowedOperation(format!("drop index {id} on {collection}")))
    }

    // -----------------------------------------------------------------------
    // Commit / abort
    // -----------------------------------------------------------------------

    fn log_summary(&mut self) -> Result<()> {
        let written: BTreeSet<String> = self.touched.keys().cloned().collect();
        let summary = tx_log::summary(self.id, &self.declared_read, &written, self.writes);
        let handle = self.handle(TRANSACTION_LOG)?;
        // no base revision for the log: other commits append to it
        // concurrently, so its revision is never wound back
        self.insert_into(&handle, TRANSACTION_LOG, summary)?;
        Ok(())
    }

    fn change_set(&self) -> Vec<CollectionChanges> {
        let mut changes = Vec::with_capacity(self.touched.len());
        for (name, keys) in &self.touched {
            let Some(handle) = self.handles.get(name) else {
                continue;
            };
            let coll = handle.read();
            let mut set = CollectionChanges {
                collection: name.clone(),
                revision: coll.revision(),
                tick: coll.tick(),
                puts: Vec::new(),
                deletes: Vec::new(),
            };
            for key in keys {
                match coll.get(key) {
                    Some(doc) => set.puts.push(doc.clone()),
                    None => set.deletes.push(key.clone()),
                }
            }
            changes.push(set);
        }
        changes
    }

    fn needs_sync(&self, requested: bool) -> bool {
        requested
            || self.ctx.vault().options().sync_on_commit
            || self
                .touched
                .keys()
                .filter_map(|name| self.handles.get(name))
                .any(|handle| handle.read().wait_for_sync())
    }

    pub(crate) fn commit(&mut self, wait_for_sync: bool) -> Result<()> {
        if !self.undo.is_empty() {
            self.log_summary()?;
            let ctx = self.ctx;
            if let Some(journal) = ctx.vault().journal() {
                let record = JournalRecord::Commit {
                    tx: self.id,
                    changes: self.change_set(),
                };
                if let Err(e) = journal.append(&record, self.needs_sync(wait_for_sync)) {
                    warn!(target: "docvault::txn", tx_id = self.id, error = %e, "journal write failed");
                    self.rollback();
                    return Err(e);
                }
            }
        }
        self.undo.clear();
        self.status = TxStatus::Committed;
        Ok(())
    }

    /// Replay the undo log newest first, then restore collection revisions.
    pub(crate) fn rollback(&mut self) {
        for entry in self.undo.drain_reverse() {
            if let Some(handle) = self.handles.get(entry.collection()) {
                handle.write().undo(entry);
            }
        }
        for (name, revision) in &self.base_revisions {
            if let Some(handle) = self.handles.get(name) {
                handle.write().restore_revision(*revision);
            }
        }
        self.status = TxStatus::Aborted;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // an action that panicked never reached commit or abort
        if self.status == TxStatus::Running {
            self.rollback();
        }
    }
}

fn lock_timeout(seconds: Option<f64>, default: Duration) -> Duration {
    match seconds {
        Some(s) => Duration::try_from_secs_f64(s).unwrap_or(Duration::MAX),
        None => default,
    }
}

/// Validate, lock, run the action, then commit or roll back.
pub(crate) fn execute(ctx: &ExecutionContext<'_>, descriptor: TransactionDescriptor<'_>) -> Result<Value> {
    descriptor.validate()?;
    let vault = ctx.vault();

    if let Some(name) = descriptor.write.iter().find(|n| tx_log::is_reserved(n)) {
        return Err(Error::DisallowedOperation(format!(
            "collection {name} cannot be used for write"
        )));
    }
    for name in descriptor.read.iter().chain(&descriptor.write) {
        vault.collection_handle(name)?;
    }

    let timeout = lock_timeout(descriptor.lock_timeout, vault.options().default_lock_timeout());
    let locks = vault
        .lock_manager()
        .acquire(&descriptor.read, &descriptor.write, timeout)?;

    // a drop or rename may have won the locks first
    let mut handles = HashMap::new();
    for name in descriptor.read.iter().chain(&descriptor.write) {
        handles.insert(name.clone(), vault.collection_handle(name)?);
    }

    let id = vault.next_transaction_id();
    let _slot = ctx.enter(id);
    debug!(
        target: "docvault::txn",
        tx_id = id,
        read = ?descriptor.read,
        write = ?descriptor.write,
        "transaction started"
    );

    let TransactionDescriptor {
        read,
        params,
        wait_for_sync,
        allow_implicit,
        action,
        ..
    } = descriptor;

    let mut tx = Transaction {
        id,
        ctx,
        locks,
        declared_read: read,
        lock_timeout: timeout,
        allow_implicit: allow_implicit.unwrap_or(vault.options().allow_implicit_collections),
        handles,
        undo: UndoLog::new(),
        touched: BTreeMap::new(),
        base_revisions: BTreeMap::new(),
        writes: 0,
        status: TxStatus::Running,
    };

    match action(&mut tx, params.as_ref()) {
        Ok(value) => {
            tx.commit(wait_for_sync.unwrap_or(false))?;
            debug!(target: "docvault::txn", tx_id = id, writes = tx.writes, "transaction committed");
            Ok(value)
        }
        Err(err) => {
            let undo_entries = tx.undo.len();
            tx.rollback();
            debug!(
                target: "docvault::txn",
                tx_id = id,
                undo_entries,
                error = %err,
                "transaction aborted"
            );
            Err(err)
        }
    }
}
