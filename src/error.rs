use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("illegal name: {0}")]
    IllegalName(String),

    #[error("document not found: {collection}/{key}")]
    DocumentNotFound { collection: String, key: String },

    #[error("illegal document key: {0}")]
    DocumentKeyBad(String),

    #[error("document must be a JSON object")]
    DocumentTypeInvalid,

    #[error("unique constraint violated in {collection}: field '{field}' value already exists")]
    UniqueConstraintViolated { collection: String, field: String },

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index type not supported: {0}")]
    UnsupportedIndex(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("collection '{0}' is not registered for this access in the running transaction")]
    UnregisteredCollection(String),

    #[error("operation not allowed inside a transaction: {0}")]
    DisallowedOperation(String),

    #[error("nested transactions are not supported")]
    NestedTransaction,

    #[error("timed out acquiring lock on collection '{0}'")]
    LockTimeout(String),

    /// Explicit rollback request raised by a transaction action.
    #[error("transaction rolled back: {0}")]
    Rollback(Value),

    #[error("corrupt journal: {0}")]
    CorruptJournal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Numeric error code, compatible with the classic ArangoDB error numbers.
    pub fn code(&self) -> u32 {
        match self {
            Error::BadParameter(_) | Error::InvalidQuery(_) => 10,
            Error::LockTimeout(_) => 18,
            Error::UnsupportedIndex(_) => 9,
            Error::CorruptJournal(_) => 1100,
            Error::DocumentNotFound { .. } => 1202,
            Error::CollectionNotFound(_) => 1203,
            Error::DuplicateName(_) => 1207,
            Error::IllegalName(_) => 1208,
            Error::UniqueConstraintViolated { .. } => 1210,
            Error::IndexNotFound(_) => 1212,
            Error::DocumentKeyBad(_) => 1221,
            Error::DocumentTypeInvalid => 1227,
            Error::NestedTransaction => 1651,
            Error::UnregisteredCollection(_) => 1652,
            Error::DisallowedOperation(_) => 1653,
            Error::Rollback(_) => 1654,
            Error::Io(_) => 2,
            Error::Json(_) => 600,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
