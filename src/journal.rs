use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collection::CollectionSnapshot;
use crate::document::{Document, Revision};
use crate::error::Result;
use crate::index::IndexDefinition;
use crate::tx_log::TransactionId;

const JOURNAL_FILE: &str = "docvault.journal";

/// Final state of the documents one commit touched in one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionChanges {
    pub collection: String,
    pub revision: Revision,
    pub tick: Revision,
    pub puts: Vec<Document>,
    pub deletes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    CreateCollection { name: String },
    DropCollection { name: String },
    RenameCollection { from: String, to: String },
    EnsureIndex { collection: String, definition: IndexDefinition },
    DropIndex { collection: String, id: String },
    SetProperties { collection: String, wait_for_sync: bool },
    Commit { tx: TransactionId, changes: Vec<CollectionChanges> },
    /// Full image of the catalog written by a checkpoint.
    Snapshot { collections: Vec<CollectionSnapshot> },
}

/// Append-only record log.
///
/// Frame format: `[crc32: u32 LE][len: u32 LE][json payload]`. Replay stops
/// at the first torn or corrupt frame; the tail is cut off so later appends
/// stay readable.
pub struct Journal {
    inner: Mutex<File>,
    path: PathBuf,
}

impl Journal {
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            inner: Mutex::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compute_crc(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    fn frame(record: &JournalRecord) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(record)?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&Self::compute_crc(&payload).to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Append one record; `sync` forces it to stable storage before returning.
    pub fn append(&self, record: &JournalRecord, sync: bool) -> Result<()> {
        let frame = Self::frame(record)?;
        let mut file = self.inner.lock();
        file.seek(SeekFrom::End(0))?;
        file.write_all(&frame)?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Read every intact record from the start of the journal.
    pub fn read_all(&self) -> Result<Vec<JournalRecord>> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(0))?;
        let file_len = file.metadata()?.len();
        let mut records = Vec::new();
        let mut pos = 0u64;

        while pos + 8 <= file_len {
            let mut header = [0u8; 8];
            if file.read_exact(&mut header).is_err() {
                break;
            }
            let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let payload_len =
                u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
            if pos + 8 + payload_len > file_len {
                break;
            }
            let mut payload = vec![0u8; payload_len as usize];
            if file.read_exact(&mut payload).is_err() {
                break;
            }
            if stored_crc != Self::compute_crc(&payload) {
                break;
            }
            match serde_json::from_slice(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
            pos += 8 + payload_len;
        }

        if pos < file_len {
            warn!(
                path = %self.path.display(),
                valid_bytes = pos,
                discarded_bytes = file_len - pos,
                "journal tail is corrupt, truncating"
            );
            file.set_len(pos)?;
            file.sync_data()?;
        }
        Ok(records)
    }

    /// Replace the journal contents with `records` atomically.
    pub fn rewrite(&self, records: &[JournalRecord]) -> Result<()> {
        let tmp_path = self.path.with_extension("journal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in records {
                tmp.write_all(&Self::frame(record)?)?;
            }
            tmp.sync_all()?;
        }

        let mut file = self.inner.lock();
        fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        info!(path = %self.path.display(), records = records.len(), "journal rewritten");
        Ok(())
    }
}
