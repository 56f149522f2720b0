use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::{json, Value};

use crate::collection::Collection;
use crate::index::IndexDefinition;

pub type TransactionId = u64;

/// Name of the system collection holding one summary per committed write
/// transaction. User transactions may read it but never declare it for write.
pub const TRANSACTION_LOG: &str = "_trx";

pub fn is_reserved(name: &str) -> bool {
    name == TRANSACTION_LOG
}

/// A fresh transaction log collection keeping at most `capacity` summaries.
pub(crate) fn bootstrap(capacity: u32) -> Collection {
    let mut coll = Collection::new(TRANSACTION_LOG);
    // capacity is validated to be at least 1, which is all a cap needs
    if let Err(e) = coll.ensure_index(&IndexDefinition::cap(capacity.max(1))) {
        tracing::error!(error = %e, "failed to install transaction log cap");
    }
    coll
}

/// Summary document recorded for a committed transaction.
pub(crate) fn summary(
    id: TransactionId,
    read: &BTreeSet<String>,
    written: &BTreeSet<String>,
    operations: usize,
) -> Value {
    json!({
        "transaction": id,
        "status": "committed",
        "collections": {
            "read": read,
            "write": written,
        },
        "operations": operations,
        "committedAt": Utc::now().to_rfc3339(),
    })
}

/// Highest transaction id recorded in the log, so ids keep increasing
/// across restarts.
pub(crate) fn highest_transaction_id(log: &Collection) -> TransactionId {
    log.all()
        .filter_map(|doc| doc.fields.get("transaction").and_then(Value::as_u64))
        .max()
        .unwrap_or(0)
}
