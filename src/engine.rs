use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::collection::Collection;
use crate::config::VaultOptions;
use crate::context::ExecutionContext;
use crate::descriptor::TransactionDescriptor;
use crate::document::{DocumentMeta, Revision};
use crate::error::{Error, Result};
use crate::index::{IndexDefinition, IndexInfo};
use crate::journal::{Journal, JournalRecord};
use crate::lock::{LockManager, LockSet};
use crate::query::{Query, QueryResult};
use crate::transaction::Transaction;
use crate::tx_log::{self, TransactionId, TRANSACTION_LOG};

static COLLECTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]{0,63}$").expect("static name pattern"));

/// Collection properties as reported by [`DocVault::properties`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionProperties {
    pub name: String,
    pub count: usize,
    pub revision: Revision,
    pub wait_for_sync: bool,
    /// Size of the cap constraint, if the collection has one.
    pub cap: Option<u32>,
}

/// An embedded document store with multi-collection transactions.
///
/// Thread-safe: the catalog sits behind a `RwLock` and every collection
/// behind its own `RwLock`, while transactions additionally hold logical
/// collection locks from the [`LockManager`]. Share it with `Arc` and give
/// each thread its own [`ExecutionContext`].
///
/// While an action runs, the vault itself refuses schema changes and new
/// transactions from that thread, so an action holding `&DocVault` cannot
/// step outside its own transaction.
pub struct DocVault {
    options: VaultOptions,
    collections: RwLock<HashMap<String, Arc<RwLock<Collection>>>>,
    locks: Arc<LockManager>,
    journal: Option<Journal>,
    next_tx_id: AtomicU64,
    /// Threads currently running a transaction action.
    active: Mutex<HashSet<ThreadId>>,
}

impl DocVault {
    fn with_parts(options: VaultOptions, journal: Option<Journal>) -> Self {
        let log = tx_log::bootstrap(options.transaction_log_capacity);
        let mut collections = HashMap::new();
        collections.insert(TRANSACTION_LOG.to_string(), Arc::new(RwLock::new(log)));
        Self {
            options,
            collections: RwLock::new(collections),
            locks: LockManager::new(),
            journal,
            next_tx_id: AtomicU64::new(1),
            active: Mutex::new(HashSet::new()),
        }
    }

    /// A purely in-memory vault with default options.
    pub fn in_memory() -> Self {
        Self::with_parts(VaultOptions::in_memory(), None)
    }

    /// Open a vault. With a `data_dir` the journal there is replayed first.
    pub fn open(options: VaultOptions) -> Result<Self> {
        options.validate()?;
        let journal = match &options.data_dir {
            Some(dir) => Some(Journal::open(dir)?),
            None => None,
        };
        let vault = Self::with_parts(options, journal);

        if let Some(journal) = &vault.journal {
            let records = journal.read_all()?;
            let replayed = records.len();
            for record in records {
                vault.replay(record)?;
            }
            info!(
                path = %journal.path().display(),
                records = replayed,
                collections = vault.collections.read().len(),
                "journal recovered"
            );
        }

        let highest = {
            let mut cols = vault.collections.write();
            let log = cols
                .entry(TRANSACTION_LOG.to_string())
                .or_insert_with(|| {
                    Arc::new(RwLock::new(tx_log::bootstrap(
                        vault.options.transaction_log_capacity,
                    )))
                })
                .read();
            tx_log::highest_transaction_id(&log)
        };
        vault.next_tx_id.store(highest + 1, Ordering::SeqCst);
        Ok(vault)
    }

    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    /// A fresh execution context bound to this vault.
    pub fn context(&self) -> ExecutionContext<'_> {
        ExecutionContext::new(self)
    }

    /// Run a transaction on a fresh execution context.
    pub fn transaction(&self, descriptor: TransactionDescriptor<'_>) -> Result<Value> {
        self.context().run(descriptor)
    }

    /// Whether a transaction action is running on the calling thread.
    pub fn in_action(&self) -> bool {
        self.active.lock().contains(&thread::current().id())
    }

    pub(crate) fn enter_action(&self) {
        self.active.lock().insert(thread::current().id());
    }

    pub(crate) fn leave_action(&self) {
        self.active.lock().remove(&thread::current().id());
    }

    fn guard_schema(&self, operation: impl Into<String>) -> Result<()> {
        if self.in_action() {
            return Err(Error::DisallowedOperation(operation.into()));
        }
        Ok(())
    }

    pub(crate) fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub(crate) fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        self.next_tx_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn collection_handle(&self, name: &str) -> Result<Arc<RwLock<Collection>>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    fn log_schema(&self, record: JournalRecord) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.append(&record, true),
            None => Ok(()),
        }
    }

    /// Exclusive logical locks on `names`, so no transaction uses them.
    fn lock_exclusive<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Result<LockSet> {
        let write: BTreeSet<String> = names.into_iter().map(str::to_string).collect();
        self.locks
            .acquire(&BTreeSet::new(), &write, self.options.default_lock_timeout())
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.guard_schema(format!("create collection {name}"))?;
        if !COLLECTION_NAME.is_match(name) {
            return Err(Error::IllegalName(name.to_string()));
        }
        let mut cols = self.collections.write();
        if cols.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        self.log_schema(JournalRecord::CreateCollection {
            name: name.to_string(),
        })?;
        cols.insert(name.to_string(), Arc::new(RwLock::new(Collection::new(name))));
        info!(collection = name, "collection created");
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.guard_schema(format!("drop collection {name}"))?;
        if tx_log::is_reserved(name) {
            return Err(Error::DisallowedOperation(format!("drop system collection {name}")));
        }
        self.collection_handle(name)?;
        let _locks = self.lock_exclusive([name])?;
        let mut cols = self.collections.write();
        if !cols.contains_key(name) {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        self.log_schema(JournalRecord::DropCollection {
            name: name.to_string(),
        })?;
        cols.remove(name);
        info!(collection = name, "collection dropped");
        Ok(())
    }

    pub fn rename_collection(&self, from: &str, to: &str) -> Result<()> {
        self.guard_schema(format!("rename collection {from} to {to}"))?;
        if tx_log::is_reserved(from) {
            return Err(Error::DisallowedOperation(format!("rename system collection {from}")));
        }
        if !COLLECTION_NAME.is_match(to) {
            return Err(Error::IllegalName(to.to_string()));
        }
        self.collection_handle(from)?;
        let _locks = self.lock_exclusive([from, to])?;
        let mut cols = self.collections.write();
        if cols.contains_key(to) {
            return Err(Error::DuplicateName(to.to_string()));
        }
        let handle = cols
            .remove(from)
            .ok_or_else(|| Error::CollectionNotFound(from.to_string()))?;
        if let Err(e) = self.log_schema(JournalRecord::RenameCollection {
            from: from.to_string(),
            to: to.to_string(),
        }) {
            cols.insert(from.to_string(), handle);
            return Err(e);
        }
        handle.write().set_name(to);
        cols.insert(to.to_string(), handle);
        info!(from, to, "collection renamed");
        Ok(())
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    pub fn properties(&self, collection: &str) -> Result<CollectionProperties> {
        let handle = self.collection_handle(collection)?;
        let coll = handle.read();
        Ok(CollectionProperties {
            name: coll.name().to_string(),
            count: coll.count(),
            revision: coll.revision(),
            wait_for_sync: coll.wait_for_sync(),
            cap: coll.cap_constraint().map(|c| c.size),
        })
    }

    pub fn set_wait_for_sync(&self, collection: &str, wait_for_sync: bool) -> Result<()> {
        self.guard_schema(format!("change properties of {collection}"))?;
        let handle = self.collection_handle(collection)?;
        let _locks = self.lock_exclusive([collection])?;
        self.log_schema(JournalRecord::SetProperties {
            collection: collection.to_string(),
            wait_for_sync,
        })?;
        handle.write().set_wait_for_sync(wait_for_sync);
        Ok(())
    }

    pub fn ensure_index(&self, collection: &str, definition: &IndexDefinition) -> Result<IndexInfo> {
        self.guard_schema(format!("ensure {} index on {collection}", definition.kind))?;
        let handle = self.collection_handle(collection)?;
        let _locks = self.lock_exclusive([collection])?;
        let mut coll = handle.write();
        let existed = coll.indexes().len();
        let info = coll.ensure_index(definition)?;
        if coll.indexes().len() != existed {
            if let Err(e) = self.log_schema(JournalRecord::EnsureIndex {
                collection: collection.to_string(),
                definition: definition.clone(),
            }) {
                coll.drop_index(&info.id)?;
                return Err(e);
            }
            info!(collection, index = %info.id, kind = %info.kind, "index created");
        }
        Ok(info)
    }

    /// Returns false when the collection has no such index.
    pub fn drop_index(&self, collection: &str, id: &str) -> Result<bool> {
        self.guard_schema(format!("drop index {id} on {collection}"))?;
        let handle = self.collection_handle(collection)?;
        let _locks = self.lock_exclusive([collection])?;
        let mut coll = handle.write();
        let known = coll.indexes().iter().any(|i| i.id == id || i.id.ends_with(&format!("/{id}")));
        if !known {
            return Ok(false);
        }
        self.log_schema(JournalRecord::DropIndex {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;
        coll.drop_index(id)
    }

    pub fn indexes(&self, collection: &str) -> Result<Vec<IndexInfo>> {
        Ok(self.collection_handle(collection)?.read().indexes())
    }

    // -----------------------------------------------------------------------
    // Single-operation transactions
    // -----------------------------------------------------------------------

    fn single<T>(
        &self,
        read: Option<&str>,
        write: Option<&str>,
        op: impl FnOnce(&mut Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut out = None;
        let mut descriptor = TransactionDescriptor::new(|tx, _| {
            out = Some(op(tx)?);
            Ok(Value::Null)
        });
        if let Some(name) = read {
            descriptor = descriptor.read(name);
        }
        if let Some(name) = write {
            descriptor = descriptor.write(name);
        }
        self.context().run(descriptor)?;
        out.ok_or_else(|| Error::BadParameter("operation produced no result".into()))
    }

    pub fn insert(&self, collection: &str, body: Value) -> Result<DocumentMeta> {
        self.single(None, Some(collection), |tx| tx.insert(collection, body))
    }

    pub fn replace(&self, collection: &str, key: &str, body: Value) -> Result<DocumentMeta> {
        self.single(None, Some(collection), |tx| tx.replace(collection, key, body))
    }

    pub fn update(&self, collection: &str, key: &str, patch: Value) -> Result<DocumentMeta> {
        self.single(None, Some(collection), |tx| tx.update(collection, key, patch))
    }

    pub fn remove(&self, collection: &str, key: &str) -> Result<DocumentMeta> {
        self.single(None, Some(collection), |tx| tx.remove(collection, key))
    }

    pub fn truncate(&self, collection: &str) -> Result<usize> {
        self.single(None, Some(collection), |tx| tx.truncate(collection))
    }

    pub fn document(&self, collection: &str, key: &str) -> Result<Value> {
        self.single(Some(collection), None, |tx| tx.document(collection, key))
    }

    pub fn count(&self, collection: &str) -> Result<usize> {
        self.single(Some(collection), None, |tx| tx.count(collection))
    }

    pub fn revision(&self, collection: &str) -> Result<Revision> {
        self.single(Some(collection), None, |tx| tx.revision(collection))
    }

    pub fn all(&self, collection: &str) -> Result<Vec<Value>> {
        self.single(Some(collection), None, |tx| tx.all(collection))
    }

    pub fn first(&self, collection: &str, n: usize) -> Result<Vec<Value>> {
        self.single(Some(collection), None, |tx| tx.first(collection, n))
    }

    pub fn by_example(&self, collection: &str, example: &Value) -> Result<Vec<Value>> {
        self.single(Some(collection), None, |tx| tx.by_example(collection, example))
    }

    pub fn first_example(&self, collection: &str, example: &Value) -> Result<Option<Value>> {
        self.single(Some(collection), None, |tx| tx.first_example(collection, example))
    }

    pub fn fulltext(&self, collection: &str, attribute: &str, query: &str) -> Result<Vec<Value>> {
        self.single(Some(collection), None, |tx| tx.fulltext(collection, attribute, query))
    }

    /// Run a query in its own transaction declaring exactly the collections
    /// it reads and writes.
    pub fn query(&self, query: &Query) -> Result<QueryResult> {
        let (read, write) = query.collections();
        let mut result = None;
        let mut descriptor = TransactionDescriptor::new(|tx, _| {
            result = Some(tx.query(query)?);
            Ok(Value::Null)
        });
        descriptor.read = read;
        descriptor.write = write;
        self.context().run(descriptor)?;
        result.ok_or_else(|| Error::BadParameter("query produced no result".into()))
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    /// Rewrite the journal as a single snapshot of the current catalog.
    /// Waits for running transactions to finish. No-op when in memory.
    pub fn checkpoint(&self) -> Result<()> {
        self.guard_schema("checkpoint")?;
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let names = self.collection_names();
        let _locks = self.lock_exclusive(names.iter().map(String::as_str))?;
        let cols = self.collections.read();
        let mut snapshots = Vec::with_capacity(cols.len());
        for name in &names {
            if let Some(handle) = cols.get(name) {
                snapshots.push(handle.read().snapshot());
            }
        }
        let collections = snapshots.len();
        journal.rewrite(&[JournalRecord::Snapshot {
            collections: snapshots,
        }])?;
        info!(collections, "checkpoint written");
        Ok(())
    }

    fn replay(&self, record: JournalRecord) -> Result<()> {
        let mut cols = self.collections.write();
        let missing = |name: &str| Error::CorruptJournal(format!("unknown collection {name}"));
        match record {
            JournalRecord::CreateCollection { name } => {
                cols.insert(name.clone(), Arc::new(RwLock::new(Collection::new(&name))));
            }
            JournalRecord::DropCollection { name } => {
                cols.remove(&name);
            }
            JournalRecord::RenameCollection { from, to } => {
                let handle = cols.remove(&from).ok_or_else(|| missing(&from))?;
                handle.write().set_name(&to);
                cols.insert(to, handle);
            }
            JournalRecord::EnsureIndex {
                collection,
                definition,
            } => {
                let handle = cols.get(&collection).ok_or_else(|| missing(&collection))?;
                handle.write().ensure_index(&definition)?;
            }
            JournalRecord::DropIndex { collection, id } => {
                let handle = cols.get(&collection).ok_or_else(|| missing(&collection))?;
                handle.write().drop_index(&id)?;
            }
            JournalRecord::SetProperties {
                collection,
                wait_for_sync,
            } => {
                let handle = cols.get(&collection).ok_or_else(|| missing(&collection))?;
                handle.write().set_wait_for_sync(wait_for_sync);
            }
            JournalRecord::Commit { changes, .. } => {
                for change in changes {
                    let handle = cols
                        .get(&change.collection)
                        .ok_or_else(|| missing(&change.collection))?;
                    let mut coll = handle.write();
                    for key in &change.deletes {
                        coll.take(key);
                    }
                    for doc in change.puts {
                        coll.put(doc);
                    }
                    coll.set_counters(change.revision, change.tick);
                }
            }
            JournalRecord::Snapshot { collections } => {
                cols.clear();
                for snapshot in collections {
                    let coll = Collection::from_snapshot(snapshot)?;
                    cols.insert(coll.name().to_string(), Arc::new(RwLock::new(coll)));
                }
            }
        }
        Ok(())
    }
}
