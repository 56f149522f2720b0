use tracing::trace;

use crate::collection::Collection;
use crate::document::Document;

/// Bounds the number of documents a collection may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapConstraint {
    pub index_id: u64,
    pub size: u32,
}

/// Evict the oldest documents until the collection fits its cap constraint.
/// Returns the evicted documents oldest first; empty when nothing was evicted.
pub fn evict_overflow(collection: &mut Collection) -> Vec<Document> {
    let Some(cap) = collection.cap_constraint() else {
        return Vec::new();
    };
    let mut evicted = Vec::new();
    while collection.count() > cap.size as usize {
        let Some(key) = collection.oldest_key() else {
            break;
        };
        if let Some(doc) = collection.take(&key) {
            trace!(collection = collection.name(), key = %doc.key, revision = doc.revision, "cap eviction");
            evicted.push(doc);
        }
    }
    evicted
}
