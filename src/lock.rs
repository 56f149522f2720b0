use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

impl LockState {
    fn available(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }
}

/// Logical per-collection locks held for the duration of a transaction.
///
/// Read locks are shared, write locks exclusive.
#[derive(Debug, Default)]
pub struct LockManager {
    state: Mutex<HashMap<String, LockState>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire every lock of a transaction in sorted name order. A name in
    /// both sets is locked for write. On timeout nothing stays held.
    pub fn acquire(
        self: &Arc<Self>,
        read: &BTreeSet<String>,
        write: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<LockSet> {
        let deadline = Instant::now().checked_add(timeout);
        let mut wanted: BTreeMap<&str, LockMode> = BTreeMap::new();
        for name in read {
            wanted.insert(name, LockMode::Read);
        }
        for name in write {
            wanted.insert(name, LockMode::Write);
        }

        let mut set = LockSet {
            manager: Arc::clone(self),
            held: BTreeMap::new(),
        };
        for (name, mode) in wanted {
            // dropping `set` on error releases what was taken so far
            self.lock_one(name, mode, deadline)?;
            set.held.insert(name.to_string(), mode);
        }
        Ok(set)
    }

    fn lock_one(&self, name: &str, mode: LockMode, deadline: Option<Instant>) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            let entry = state.entry(name.to_string()).or_default();
            if entry.available(mode) {
                match mode {
                    LockMode::Read => entry.readers += 1,
                    LockMode::Write => entry.writer = true,
                }
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        warn!(target: "docvault::lock", collection = name, ?mode, "lock timeout");
                        return Err(Error::LockTimeout(name.to_string()));
                    }
                    self.released.wait_until(&mut state, deadline);
                }
                None => self.released.wait(&mut state),
            }
        }
    }

    fn unlock(&self, name: &str, mode: LockMode) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(name) {
            match mode {
                LockMode::Read => entry.readers = entry.readers.saturating_sub(1),
                LockMode::Write => entry.writer = false,
            }
            if entry.readers == 0 && !entry.writer {
                state.remove(name);
            }
        }
        drop(state);
        self.released.notify_all();
    }
}

/// Locks held by one transaction. Released on drop.
#[derive(Debug)]
pub struct LockSet {
    manager: Arc<LockManager>,
    held: BTreeMap<String, LockMode>,
}

impl LockSet {
    pub fn mode(&self, name: &str) -> Option<LockMode> {
        self.held.get(name).copied()
    }

    pub fn can_write(&self, name: &str) -> bool {
        self.mode(name) == Some(LockMode::Write)
    }

    pub fn can_read(&self, name: &str) -> bool {
        self.held.contains_key(name)
    }

    /// Take an additional shared lock for an implicitly read collection.
    pub fn add_shared(&mut self, name: &str, timeout: Duration) -> Result<()> {
        if self.can_read(name) {
            return Ok(());
        }
        let deadline = Instant::now().checked_add(timeout);
        self.manager.lock_one(name, LockMode::Read, deadline)?;
        self.held.insert(name.to_string(), LockMode::Read);
        Ok(())
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        for (name, mode) in std::mem::take(&mut self.held) {
            self.manager.unlock(&name, mode);
        }
    }
}
