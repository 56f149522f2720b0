use std::cell::Cell;

use serde_json::Value;

use crate::descriptor::{ActionRegistry, TransactionDescriptor};
use crate::engine::DocVault;
use crate::error::{Error, Result};
use crate::index::{IndexDefinition, IndexInfo};
use crate::transaction;
use crate::tx_log::TransactionId;

/// Runs transactions against a [`DocVault`] for one thread of control.
///
/// Holds the single "current transaction" slot: while an action runs, a
/// second `run` fails with `NestedTransaction` and schema operations fail
/// with `DisallowedOperation`. The running thread is also registered with
/// the vault, so a fresh context on that thread is refused as well.
/// Contexts are cheap; give each worker thread its own.
pub struct ExecutionContext<'v> {
    vault: &'v DocVault,
    current: Cell<Option<TransactionId>>,
}

/// Clears the slot when the running transaction ends, however it ends.
pub(crate) struct SlotGuard<'c> {
    slot: &'c Cell<Option<TransactionId>>,
    vault: &'c DocVault,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.set(None);
        self.vault.leave_action();
    }
}

impl<'v> ExecutionContext<'v> {
    pub fn new(vault: &'v DocVault) -> Self {
        Self {
            vault,
            current: Cell::new(None),
        }
    }

    pub fn vault(&self) -> &'v DocVault {
        self.vault
    }

    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.current.get()
    }

    pub fn in_transaction(&self) -> bool {
        self.current.get().is_some()
    }

    fn nested(&self) -> bool {
        self.in_transaction() || self.vault.in_action()
    }

    pub(crate) fn enter(&self, id: TransactionId) -> SlotGuard<'_> {
        self.current.set(Some(id));
        self.vault.enter_action();
        SlotGuard {
            slot: &self.current,
            vault: self.vault,
        }
    }

    /// Run a transaction. The action's return value is returned unchanged on
    /// commit; any error it returns is returned after the rollback.
    pub fn run(&self, descriptor: TransactionDescriptor<'_>) -> Result<Value> {
        if self.nested() {
            return Err(Error::NestedTransaction);
        }
        transaction::execute(self, descriptor)
    }

    /// Run a transaction given in its JSON form, resolving the action source
    /// text through `registry`.
    pub fn run_json(&self, raw: &Value, registry: &ActionRegistry) -> Result<Value> {
        if self.nested() {
            return Err(Error::NestedTransaction);
        }
        let descriptor = TransactionDescriptor::from_json(raw, registry)?;
        transaction::execute(self, descriptor)
    }

    fn guard(&self, operation: &str) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::DisallowedOperation(operation.to_string()));
        }
        Ok(())
    }

    pub fn create_collection(&self, name: &str) -> Result<()> {
        self.guard("create collection")?;
        self.vault.create_collection(name)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.guard("drop collection")?;
        self.vault.drop_collection(name)
    }

    pub fn rename_collection(&self, from: &str, to: &str) -> Result<()> {
        self.guard("rename collection")?;
        self.vault.rename_collection(from, to)
    }

    pub fn ensure_index(&self, collection: &str, definition: &IndexDefinition) -> Result<IndexInfo> {
        self.guard("ensure index")?;
        self.vault.ensure_index(collection, definition)
    }

    pub fn drop_index(&self, collection: &str, id: &str) -> Result<bool> {
        self.guard("drop index")?;
        self.vault.drop_index(collection, id)
    }
}
