pub mod cap;
pub mod collection;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod document;
pub mod engine;
pub mod error;
pub mod filter;
pub mod fulltext;
pub mod index;
pub mod journal;
pub mod lock;
pub mod query;
pub mod transaction;
pub mod tx_log;
pub mod undo;
pub mod value;

pub use config::VaultOptions;
pub use context::ExecutionContext;
pub use descriptor::{ActionRegistry, TransactionDescriptor};
pub use document::{DocumentMeta, Revision};
pub use engine::{CollectionProperties, DocVault};
pub use error::{Error, Result};
pub use index::{IndexDefinition, IndexInfo, IndexKind};
pub use query::{Query, QueryResult, QueryStats, SortOrder};
pub use transaction::{Transaction, TxStatus};
pub use tx_log::{TransactionId, TRANSACTION_LOG};
