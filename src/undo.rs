use crate::document::Document;

/// A reversible delta recorded for one mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    Insert { collection: String, key: String },
    Remove { collection: String, prior: Document },
    Replace { collection: String, prior: Document },
    Update { collection: String, prior: Document },
    Truncate { collection: String, priors: Vec<Document> },
    CapEvict { collection: String, evicted: Vec<Document> },
}

impl UndoEntry {
    pub fn collection(&self) -> &str {
        match self {
            UndoEntry::Insert { collection, .. }
            | UndoEntry::Remove { collection, .. }
            | UndoEntry::Replace { collection, .. }
            | UndoEntry::Update { collection, .. }
            | UndoEntry::Truncate { collection, .. }
            | UndoEntry::CapEvict { collection, .. } => collection,
        }
    }
}

/// Append-only log of undo entries, replayed newest first on abort.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consume the log, yielding entries in the order they must be undone.
    pub fn drain_reverse(&mut self) -> impl Iterator<Item = UndoEntry> + '_ {
        self.entries.drain(..).rev()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
